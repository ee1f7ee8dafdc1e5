//! The closed set of languages supported by the pipeline.
//!
//! Each language knows how to turn a list of source files into a compiled artifact and how to run
//! the result; the compile and execute command lines are a fixed table, extending it is a design
//! change. The languages are exposed as trait objects through a process-wide registry:
//!
//! ```
//! use taskprep_lang::LanguageManager;
//!
//! let lang = LanguageManager::from_name("c++").unwrap();
//! assert_eq!(lang.name(), "c++");
//! let lang = LanguageManager::from_file_name("solution.pas").unwrap();
//! assert_eq!(lang.name(), "pas");
//! ```

#![deny(missing_docs)]

mod language;
pub mod languages;

pub use language::Language;
pub use languages::LanguageManager;

/// Order the source files for the compiler: a grader named `grader.<ext>` (with the language's
/// primary extension) goes first, then the submitted source, then the remaining helpers.
pub fn compilation_order(
    language: &dyn Language,
    source: &str,
    graders: &[String],
) -> Vec<String> {
    let primary_grader = language
        .extensions()
        .first()
        .map(|ext| format!("grader.{}", ext));
    let mut prioritized = vec![];
    let mut normal = vec![source.to_string()];
    for grader in graders {
        if Some(grader) == primary_grader.as_ref() {
            prioritized.push(grader.clone());
        } else {
            normal.push(grader.clone());
        }
    }
    prioritized.extend(normal);
    prioritized
}

/// The graders applicable to a language, selected by extension.
pub fn graders_for<'g>(language: &dyn Language, graders: &'g [String]) -> Vec<&'g String> {
    graders
        .iter()
        .filter(|name| {
            language
                .extensions()
                .iter()
                .any(|ext| name.ends_with(&format!(".{}", ext)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_compilation_order_grader_first() {
        let lang = LanguageManager::from_name("c++").unwrap();
        let graders = vec!["grader.cpp".to_string(), "helper.cpp".to_string()];
        let order = compilation_order(lang, "sol.cpp", &graders);
        assert_eq!(order, vec!["grader.cpp", "sol.cpp", "helper.cpp"]);
    }

    #[test]
    fn test_compilation_order_no_grader() {
        let lang = LanguageManager::from_name("c++").unwrap();
        let order = compilation_order(lang, "sol.cpp", &[]);
        assert_eq!(order, vec!["sol.cpp"]);
    }

    #[test]
    fn test_graders_for_filters_by_extension() {
        let lang = LanguageManager::from_name("java").unwrap();
        let graders = vec!["grader.cpp".to_string(), "grader.java".to_string()];
        let applicable = graders_for(lang, &graders);
        assert_eq!(applicable, vec!["grader.java"]);
    }
}
