use crate::Language;

/// The Pascal language. Compiles a single source file with `fpc`.
#[derive(Debug)]
pub struct LanguagePascal;

impl Language for LanguagePascal {
    fn name(&self) -> &'static str {
        "pas"
    }

    fn extensions(&self) -> Vec<&'static str> {
        vec!["pas"]
    }

    fn compilation_commands(&self, sources: &[String], out: &str) -> Vec<Vec<String>> {
        // fpc compiles one program; the helpers are found as units in the same directory
        let source = sources.first().cloned().unwrap_or_default();
        vec![vec![
            "fpc".to_string(),
            "-XS".to_string(),
            "-O2".to_string(),
            format!("-o{}", out),
            source,
        ]]
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
        let commands = LanguagePascal.compilation_commands(&["sol.pas".into()], "bin");
        assert_eq!(
            commands,
            vec![vec!["fpc", "-XS", "-O2", "-obin", "sol.pas"]]
        );
    }

    #[test]
    fn test_execution_command() {
        assert_eq!(LanguagePascal.execution_command("bin", None), vec!["./bin"]);
    }
}
