//! The implementations of the supported languages and their registry.

mod cpp;
mod java;
mod pascal;

pub use cpp::LanguageCpp;
pub use java::LanguageJava;
pub use pascal::LanguagePascal;

use std::path::Path;
use std::sync::Arc;

use crate::Language;

lazy_static::lazy_static! {
    /// The registry with all the known languages.
    static ref KNOWN_LANGUAGES: Vec<Arc<dyn Language>> = vec![
        Arc::new(LanguageCpp),
        Arc::new(LanguageJava),
        Arc::new(LanguagePascal),
    ];
}

/// Entry point of the language registry.
pub struct LanguageManager;

impl LanguageManager {
    /// Look up a language by its name, `None` if the language is not supported.
    pub fn from_name(name: &str) -> Option<&'static dyn Language> {
        KNOWN_LANGUAGES
            .iter()
            .find(|lang| lang.name() == name)
            .map(|lang| &**lang)
    }

    /// Detect the language of a file by its extension, `None` if no known language matches.
    pub fn from_file_name<P: AsRef<Path>>(path: P) -> Option<&'static dyn Language> {
        let ext = path.as_ref().extension()?.to_str()?.to_lowercase();
        KNOWN_LANGUAGES
            .iter()
            .find(|lang| lang.extensions().contains(&ext.as_str()))
            .map(|lang| &**lang)
    }

    /// The names of all the supported languages.
    pub fn supported_languages() -> Vec<&'static str> {
        KNOWN_LANGUAGES.iter().map(|lang| lang.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(LanguageManager::from_name("c++").unwrap().name(), "c++");
        assert_eq!(LanguageManager::from_name("java").unwrap().name(), "java");
        assert_eq!(LanguageManager::from_name("pas").unwrap().name(), "pas");
        assert!(LanguageManager::from_name("brainfuck").is_none());
    }

    #[test]
    fn test_from_file_name() {
        assert_eq!(
            LanguageManager::from_file_name("sol.cpp").unwrap().name(),
            "c++"
        );
        assert_eq!(
            LanguageManager::from_file_name("Sol.java").unwrap().name(),
            "java"
        );
        assert_eq!(
            LanguageManager::from_file_name("sol.pas").unwrap().name(),
            "pas"
        );
        assert!(LanguageManager::from_file_name("sol.py").is_none());
        assert!(LanguageManager::from_file_name("noext").is_none());
    }

    #[test]
    fn test_supported_languages() {
        assert_eq!(
            LanguageManager::supported_languages(),
            vec!["c++", "java", "pas"]
        );
    }
}
