use crate::config::AnalysisConfig;
use crate::state::Mode;

const CODE_SYSTEM_PROMPT: &str = "You are an expert software engineer analyzing screenshots of \
programming problems and code. Reply with a single JSON object with the keys \"code\" (a complete, \
working solution), \"summary\" (a concise explanation of the approach), \"timeComplexity\", \
\"spaceComplexity\" (big-O notation with a short justification) and \"language\" (the programming \
language of the solution).";

const GENERAL_SYSTEM_PROMPT: &str = "You are a careful assistant analyzing screenshots. Reply with \
a single JSON object with the keys \"answer\" (the direct answer or solution), \"explanation\" (the \
reasoning behind it) and \"test\" (how to verify the answer, as a short checklist).";

const CODE_DEFAULT_PROMPT: &str = "Analyze the screenshots. Identify the problem or code shown, \
then provide a solution with its time and space complexity.";

const GENERAL_DEFAULT_PROMPT: &str = "Analyze the screenshots and answer the question or task \
they show.";

pub fn system_prompt(mode: Mode) -> &'static str {
    match mode {
        Mode::Code => CODE_SYSTEM_PROMPT,
        Mode::General => GENERAL_SYSTEM_PROMPT,
    }
}

/// Instruction text for `mode`, honoring config overrides.
pub fn default_prompt(mode: Mode, config: &AnalysisConfig) -> String {
    let custom = match mode {
        Mode::Code => config.code_prompt.as_deref(),
        Mode::General => config.general_prompt.as_deref(),
    };
    match custom.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prompt) => prompt.to_string(),
        None => match mode {
            Mode::Code => CODE_DEFAULT_PROMPT.to_string(),
            Mode::General => GENERAL_DEFAULT_PROMPT.to_string(),
        },
    }
}

/// User message text. With a previous result the reply should extend it
/// instead of starting over.
pub fn user_prompt(prompt: &str, previous_context: Option<&str>, image_count: usize) -> String {
    let mut text = String::with_capacity(prompt.len() + 256);
    text.push_str(prompt.trim());
    text.push_str(&format!("\n\nScreenshots attached: {image_count}."));
    if let Some(context) = previous_context.filter(|c| !c.trim().is_empty()) {
        text.push_str(
            "\n\nPrevious analysis of earlier screenshots (JSON). Treat the new screenshots as \
             additional context: keep what is still correct, and update or extend it where the \
             screenshots add information.\n",
        );
        text.push_str(context);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_prompt_overrides_default() {
        let mut config = AnalysisConfig::default();
        assert_eq!(default_prompt(Mode::Code, &config), CODE_DEFAULT_PROMPT);

        config.general_prompt = Some("  Summarize the slide.  ".into());
        assert_eq!(default_prompt(Mode::General, &config), "Summarize the slide.");
        assert_eq!(default_prompt(Mode::Code, &config), CODE_DEFAULT_PROMPT);

        config.code_prompt = Some("   ".into());
        assert_eq!(default_prompt(Mode::Code, &config), CODE_DEFAULT_PROMPT);
    }

    #[test]
    fn previous_context_is_embedded_inline() {
        let fresh = user_prompt("Solve it.", None, 2);
        assert!(fresh.starts_with("Solve it."));
        assert!(!fresh.contains("Previous analysis"));

        let follow_up = user_prompt("Solve it.", Some("{\"code\":\"x\"}"), 1);
        assert!(follow_up.contains("Previous analysis"));
        assert!(follow_up.ends_with("{\"code\":\"x\"}"));
    }

    #[test]
    fn system_prompts_ask_for_mode_keys() {
        assert!(system_prompt(Mode::Code).contains("timeComplexity"));
        assert!(system_prompt(Mode::General).contains("\"test\""));
    }
}
