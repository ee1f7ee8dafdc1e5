/// Trait that defines the properties of the supported languages.
///
/// A language knows the command sequence that produces a compiled artifact from an ordered list of
/// source files, and the command line that runs the result.
pub trait Language: std::fmt::Debug + Send + Sync {
    /// Full name of the language, as spelled in the problem manifests. This must be unique between
    /// all the other languages.
    fn name(&self) -> &'static str;

    /// List of valid extensions for this language. A file is considered in this language if its
    /// extension is inside this list. The first one is the primary extension, used to recognize
    /// the grader.
    fn extensions(&self) -> Vec<&'static str>;

    /// The sequence of command lines producing the compiled artifact named `out` from the given
    /// sources. The sources are already in compilation order.
    fn compilation_commands(&self, sources: &[String], out: &str) -> Vec<Vec<String>>;

    /// The command line that runs the compiled artifact named `compiled`. For the languages that
    /// need an entry point, `main` is its name.
    fn execution_command(&self, compiled: &str, main: Option<&str>) -> Vec<String>;

    /// The entry point to use when running a compiled artifact, given the name of the submitted
    /// source and the helpers compiled with it. Only meaningful for the languages that run inside
    /// a VM; the others return `None`.
    fn main_unit(&self, _source: &str, _graders: &[String]) -> Option<String> {
        None
    }
}

impl PartialEq for &dyn Language {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}
