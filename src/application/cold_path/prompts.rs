//! Prompt loading. Prompts live in `<base_dir>/prompts/` so operators can
//! tune them without a rebuild; the repository copies are the fallback.

use anyhow::Result;
use std::path::Path;

/// Strict output contract appended to every system prompt.
pub const JSON_CONTRACT: &str = "\n\nCRITICAL OUTPUT FORMAT:\nReturn ONLY a single JSON object.\nNo markdown. No prose. No code fences.\nThe JSON object must match the schema provided above exactly.\n";

const SANAD_DEFAULT: &str = include_str!("../../../prompts/sanad-verifier.md");
const BULL_DEFAULT: &str = include_str!("../../../prompts/bull-albaqarah.md");
const BEAR_DEFAULT: &str = include_str!("../../../prompts/bear-aldahhak.md");
const JUDGE_DEFAULT: &str = include_str!("../../../prompts/judge-almuhasbi.md");

#[derive(Debug, Clone)]
pub struct PromptSet {
    pub sanad: String,
    pub bull: String,
    pub bear: String,
    pub judge: String,
}

impl PromptSet {
    pub fn load(prompts_dir: &Path) -> Result<Self> {
        Ok(Self {
            sanad: load_or_default(prompts_dir, "sanad-verifier.md", SANAD_DEFAULT),
            bull: load_or_default(prompts_dir, "bull-albaqarah.md", BULL_DEFAULT),
            bear: load_or_default(prompts_dir, "bear-aldahhak.md", BEAR_DEFAULT),
            judge: load_or_default(prompts_dir, "judge-almuhasbi.md", JUDGE_DEFAULT),
        })
    }
}

fn load_or_default(dir: &Path, name: &str, default: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_when_directory_missing() {
        let set = PromptSet::load(Path::new("/nonexistent/prompts")).unwrap();
        assert!(set.sanad.contains("Sanad"));
        assert!(set.bear.contains("never skipped"));
        assert!(set.judge.contains("REJECT"));
    }

    #[test]
    fn operator_prompts_override_defaults() {
        let dir = std::env::temp_dir().join(format!("prompts_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bull-albaqarah.md"), "custom bull").unwrap();

        let set = PromptSet::load(&dir).unwrap();
        assert_eq!(set.bull, "custom bull");
        assert!(set.bear.contains("Al-Dahhak"));
    }
}
