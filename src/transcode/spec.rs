use once_cell::sync::Lazy;
use regex::Regex;

/// Marker the external tool understands as "read this input from stdin".
pub const STDIN_MARKER: &str = "pipe:0";

/// Marker the external tool understands as "write this output to stdout".
pub const STDOUT_MARKER: &str = "pipe:1";

/// Where an input's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// Filesystem path, URL, or generator expression, passed through verbatim
    Path(String),
    /// The controller's stdin feeder; resolves to the stdin marker
    Stdin,
}

/// One input clause: a source plus the option tokens emitted before its `-i`.
#[derive(Debug, Clone)]
pub struct InputSpec {
    pub source: InputSource,
    pub options: Vec<String>,
}

impl InputSpec {
    pub fn path(source: impl Into<String>) -> Self {
        Self {
            source: InputSource::Path(source.into()),
            options: Vec::new(),
        }
    }

    pub fn stdin() -> Self {
        Self {
            source: InputSource::Stdin,
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn resolved_source(&self) -> &str {
        match &self.source {
            InputSource::Path(path) => path.as_str(),
            InputSource::Stdin => STDIN_MARKER,
        }
    }
}

/// Where an output's bytes go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Filesystem path or URL, passed through verbatim
    Path(String),
    /// The subprocess's stdout; bytes are delivered to the sinks registered
    /// on the controller
    Pipe,
}

/// One output clause: a target plus the option tokens emitted before it.
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub target: OutputTarget,
    pub options: Vec<String>,
}

impl OutputSpec {
    pub fn path(destination: impl Into<String>) -> Self {
        Self {
            target: OutputTarget::Path(destination.into()),
            options: Vec::new(),
        }
    }

    pub fn pipe() -> Self {
        Self {
            target: OutputTarget::Pipe,
            options: Vec::new(),
        }
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn resolved_target(&self) -> &str {
        match &self.target {
            OutputTarget::Path(path) => path.as_str(),
            OutputTarget::Pipe => STDOUT_MARKER,
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self.target, OutputTarget::Pipe)
    }
}

static PROTOCOL_SOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*://").unwrap());

static GENERATOR_SOURCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:nullsrc|anullsrc|anoisesrc|testsrc2?|rgbtestsrc|smptebars|smptehdbars|color|sine)(?:=|$)")
        .unwrap()
});

/// `%d`-style numbered-sequence placeholder, as in `segment_%03d.ts`.
static SEQUENCE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"%\d*d").unwrap());

/// True for sources that never exist on disk: pipe markers, protocol URLs,
/// and the lavfi generator syntax.
pub fn is_synthetic_source(source: &str) -> bool {
    source == "-"
        || source.starts_with("pipe:")
        || PROTOCOL_SOURCE.is_match(source)
        || GENERATOR_SOURCE.is_match(source)
}

pub fn has_sequence_placeholder(path: &str) -> bool {
    SEQUENCE_PLACEHOLDER.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_source_markers() {
        assert_eq!(InputSpec::path("a.mp4").resolved_source(), "a.mp4");
        assert_eq!(InputSpec::stdin().resolved_source(), "pipe:0");
        assert_eq!(OutputSpec::path("b.mkv").resolved_target(), "b.mkv");
        assert_eq!(OutputSpec::pipe().resolved_target(), "pipe:1");
    }

    #[test]
    fn test_with_options_appends_in_order() {
        let spec = InputSpec::path("a.mp4")
            .with_options(["-ss", "10"])
            .with_options(["-t", "5"]);
        assert_eq!(spec.options, vec!["-ss", "10", "-t", "5"]);
    }

    #[test]
    fn test_synthetic_sources_are_recognized() {
        assert!(is_synthetic_source("-"));
        assert!(is_synthetic_source("pipe:0"));
        assert!(is_synthetic_source("pipe:3"));
        assert!(is_synthetic_source("rtmp://example.com/live"));
        assert!(is_synthetic_source("http://example.com/a.mp4"));
        assert!(is_synthetic_source("testsrc"));
        assert!(is_synthetic_source("testsrc2=duration=5"));
        assert!(is_synthetic_source("color=c=red:size=320x240"));
        assert!(is_synthetic_source("anullsrc"));
        assert!(is_synthetic_source("sine=frequency=440"));
    }

    #[test]
    fn test_plain_paths_are_not_synthetic() {
        assert!(!is_synthetic_source("a.mp4"));
        assert!(!is_synthetic_source("./testsrc.mp4"));
        assert!(!is_synthetic_source("colorful.mkv"));
        assert!(!is_synthetic_source("/media/sine.wav"));
    }

    #[test]
    fn test_sequence_placeholder_detection() {
        assert!(has_sequence_placeholder("out%03d.ts"));
        assert!(has_sequence_placeholder("out%d.ts"));
        assert!(!has_sequence_placeholder("out.ts"));
        assert!(!has_sequence_placeholder("100%.mkv"));
    }
}
