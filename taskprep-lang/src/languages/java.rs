use crate::Language;

/// The Java language.
///
/// The sources are compiled with `javac` and the resulting class files are packed in a jar named
/// like the compiled artifact. When a `grader.java` helper is compiled together with the
/// submission, the entry point is the grader.
#[derive(Debug)]
pub struct LanguageJava;

impl Language for LanguageJava {
    fn name(&self) -> &'static str {
        "java"
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["java"]
    }

    fn compilation_commands(&self, sources: &[String], out: &str) -> Vec<Vec<String>> {
        let mut javac = vec!["javac".to_string()];
        javac.extend(sources.iter().cloned());
        vec![
            javac,
            vec![
                "jar".to_string(),
                "cf".to_string(),
                format!("{}.jar", out),
                "*.class".to_string(),
            ],
            vec!["mv".to_string(), format!("{}.jar", out), out.to_string()],
        ]
    }

    fn execution_command(&self, compiled: &str, main: Option<&str>) -> Vec<String> {
        vec![
            "java".to_string(),
            "-Xmx512M".to_string(),
            "-Xss64M".to_string(),
            "-cp".to_string(),
            compiled.to_string(),
            main.unwrap_or("Main").to_string(),
        ]
    }

    fn main_unit(&self, source: &str, graders: &[String]) -> Option<String> {
        if graders.iter().any(|g| g == "grader.java") {
            Some("grader".to_string())
        } else {
            Some(source.trim_end_matches(".java").to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_compilation_commands() {
        let commands = LanguageJava.compilation_commands(&["Sol.java".into()], "bin");
        assert_eq!(
            commands,
            vec![
                vec!["javac".to_string(), "Sol.java".to_string()],
                vec![
                    "jar".to_string(),
                    "cf".to_string(),
                    "bin.jar".to_string(),
                    "*.class".to_string()
                ],
                vec!["mv".to_string(), "bin.jar".to_string(), "bin".to_string()],
            ]
        );
    }

    #[test]
    fn test_execution_command() {
        assert_eq!(
            LanguageJava.execution_command("bin", Some("Sol")),
            vec!["java", "-Xmx512M", "-Xss64M", "-cp", "bin", "Sol"]
        );
    }

    #[test]
    fn test_main_unit_with_grader() {
        let main = LanguageJava.main_unit("Sol.java", &["grader.java".to_string()]);
        assert_eq!(main, Some("grader".to_string()));
    }

    #[test]
    fn test_main_unit_without_grader() {
        let main = LanguageJava.main_unit("Sol.java", &[]);
        assert_eq!(main, Some("Sol".to_string()));
    }
}
