use crate::Language;

/// The C++ language.
#[derive(Debug)]
pub struct LanguageCpp;

impl Language for LanguageCpp {
    fn name(&self) -> &'static str {
        "c++"
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["cpp", "cc", "cxx", "c++"]
    }

    fn compilation_commands(&self, sources: &[String], out: &str) -> Vec<Vec<String>> {
        let mut command = vec![
            "g++".to_string(),
            "-x".to_string(),
            "c++".to_string(),
            "--std".to_string(),
            "gnu++14".to_string(),
        ];
        command.extend(sources.iter().cloned());
        command.extend(["-O2".to_string(), "-o".to_string(), out.to_string()]);
        vec![command]
    }

    fn execution_command(&self, compiled: &str, _main: Option<&str>) -> Vec<String> {
        vec![format!("./{}", compiled)]
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_compilation_commands() {
        let commands =
            LanguageCpp.compilation_commands(&["grader.cpp".into(), "sol.cpp".into()], "bin");
        assert_eq!(
            commands,
            vec![vec![
                "g++", "-x", "c++", "--std", "gnu++14", "grader.cpp", "sol.cpp", "-O2", "-o",
                "bin"
            ]]
        );
    }

    #[test]
    fn test_execution_command() {
        assert_eq!(LanguageCpp.execution_command("bin", None), vec!["./bin"]);
    }
}
