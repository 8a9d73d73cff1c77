//! Editor languages offered by a session, keyed by their Judge0 ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Programming language of a session's document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    Cpp,
    C,
    Java,
    Python,
    JavaScript,
}

impl Language {
    pub const ALL: [Language; 5] = [
        Language::Cpp,
        Language::C,
        Language::Java,
        Language::Python,
        Language::JavaScript,
    ];

    /// Judge0 language id used when submitting code for execution.
    pub fn judge0_id(self) -> u32 {
        match self {
            Language::Cpp => 54,
            Language::C => 50,
            Language::Java => 62,
            Language::Python => 71,
            Language::JavaScript => 63,
        }
    }

    pub fn from_judge0_id(id: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|lang| lang.judge0_id() == id)
    }

    /// Short machine name (`cpp`, `python`, ...).
    pub fn name(self) -> &'static str {
        match self {
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Java => "java",
            Language::Python => "python",
            Language::JavaScript => "javascript",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Language::Cpp => "C++",
            Language::C => "C",
            Language::Java => "Java",
            Language::Python => "Python",
            Language::JavaScript => "JavaScript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Language {
    type Err = SyncError;

    /// Accepts the machine name, a common alias, or a Judge0 id.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase();
        let lang = match key.as_str() {
            "cpp" | "c++" => Language::Cpp,
            "c" => Language::C,
            "java" => Language::Java,
            "python" | "py" => Language::Python,
            "javascript" | "js" => Language::JavaScript,
            other => other
                .parse::<u32>()
                .ok()
                .and_then(Language::from_judge0_id)
                .ok_or_else(|| SyncError::UnknownLanguage(s.to_string()))?,
        };
        Ok(lang)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_cpp() {
        assert_eq!(Language::default(), Language::Cpp);
        assert_eq!(Language::default().judge0_id(), 54);
    }

    #[test]
    fn test_judge0_ids() {
        assert_eq!(Language::C.judge0_id(), 50);
        assert_eq!(Language::Java.judge0_id(), 62);
        assert_eq!(Language::Python.judge0_id(), 71);
        assert_eq!(Language::JavaScript.judge0_id(), 63);
        for lang in Language::ALL {
            assert_eq!(Language::from_judge0_id(lang.judge0_id()), Some(lang));
        }
        assert_eq!(Language::from_judge0_id(999), None);
    }

    #[test]
    fn test_parse_names_and_aliases() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!(" C++ ".parse::<Language>().unwrap(), Language::Cpp);
        assert_eq!("JS".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("62".parse::<Language>().unwrap(), Language::Java);
        for lang in Language::ALL {
            assert_eq!(lang.to_string().parse::<Language>().unwrap(), lang);
        }
    }

    #[test]
    fn test_parse_unknown() {
        let err = "cobol".parse::<Language>().unwrap_err();
        assert!(matches!(err, SyncError::UnknownLanguage(ref s) if s == "cobol"));
    }
}
