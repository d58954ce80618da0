use regex::Regex;

const OPT_OUT_PATTERN: &str = r"(?i)^(?:please\s+)?(stop|stopall|unsubscribe|cancel|end|quit)\b";
const HELP_PATTERN: &str = r"(?i)^(?:please\s+)?(help|info)\b";
const OPT_IN_PATTERN: &str = r"(?i)^(?:please\s+)?(start|unstop|subscribe)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordKind {
    OptOut,
    Help,
    OptIn,
}

#[derive(Debug, Clone)]
struct Patterns {
    opt_out: Regex,
    help: Regex,
    opt_in: Regex,
}

/// Carrier keyword detector. A disabled detector never matches.
#[derive(Debug, Clone)]
pub struct KeywordDetector {
    patterns: Option<Patterns>,
}

impl KeywordDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: Some(Patterns {
                opt_out: Regex::new(OPT_OUT_PATTERN)?,
                help: Regex::new(HELP_PATTERN)?,
                opt_in: Regex::new(OPT_IN_PATTERN)?,
            }),
        })
    }

    pub fn disabled() -> Self {
        Self { patterns: None }
    }

    pub fn is_opt_out(&self, body: &str) -> bool {
        self.patterns
            .as_ref()
            .is_some_and(|p| p.opt_out.is_match(body.trim()))
    }

    pub fn is_help(&self, body: &str) -> bool {
        self.patterns
            .as_ref()
            .is_some_and(|p| p.help.is_match(body.trim()))
    }

    pub fn is_opt_in(&self, body: &str) -> bool {
        self.patterns
            .as_ref()
            .is_some_and(|p| p.opt_in.is_match(body.trim()))
    }

    /// Opt-out wins over help and opt-in.
    pub fn detect(&self, body: &str) -> Option<KeywordKind> {
        if self.is_opt_out(body) {
            Some(KeywordKind::OptOut)
        } else if self.is_help(body) {
            Some(KeywordKind::Help)
        } else if self.is_opt_in(body) {
            Some(KeywordKind::OptIn)
        } else {
            None
        }
    }
}
