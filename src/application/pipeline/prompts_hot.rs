//! Hot-path prompt access. Same prompt files as the cold path.

use std::path::Path;

use crate::application::cold_path::prompts::PromptSet;

/// Appended to the Judge system prompt in paper mode. Suspends live-mode
/// trust floors so rejections still generate learning trades; the hard
/// rules (rugpull flags, confident rejects) stay binding.
pub const JUDGE_PAPER_CALIBRATION: &str = "\n\n--- PAPER MODE CALIBRATION ---\nMODE: PAPER TRADING (simulated, no real money at risk)\n\nThe live-mode minimum trust floor is suspended; the paper floor is 15.\nREJECT only when rugpull flags are present, R:R is below 1:1, or the bear\ncase shows specific structural fraud. Default stance: APPROVE. Paper\nexecutions generate the outcome data that calibrates sizing and selection.\n--- END PAPER MODE ---";

fn load(base_dir: &Path) -> PromptSet {
    // PromptSet::load falls back to the embedded defaults
    PromptSet::load(&base_dir.join("prompts")).unwrap_or_else(|_| PromptSet {
        sanad: String::new(),
        bull: String::new(),
        bear: String::new(),
        judge: String::new(),
    })
}

pub fn sanad_system(base_dir: &Path) -> String {
    load(base_dir).sanad
}

pub fn bull_system(base_dir: &Path) -> String {
    load(base_dir).bull
}

pub fn bear_system(base_dir: &Path) -> String {
    load(base_dir).bear
}

pub fn judge_system(base_dir: &Path) -> String {
    load(base_dir).judge
}
