// Definition error types
// Carries line/column info, source context and suggestions for common mistakes

use std::fmt;

/// Error raised while loading or validating a pipeline definition.
///
/// Always fatal: a run never starts from a definition that produced one.
#[derive(Debug, Clone)]
pub struct DefinitionError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when the error has no source position)
    pub line: usize,
    /// Column number (1-indexed, 0 when the error has no source position)
    pub column: usize,
    /// Surrounding source lines
    pub context: String,
    /// Optional hint for fixing the error
    pub suggestion: Option<String>,
    /// The kind of error
    pub kind: DefinitionErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Well-formed YAML with the wrong shape
    InvalidSchema,
    /// Two jobs share a name
    DuplicateJob,
    /// A job needs a job that does not exist
    UnknownDependency,
    /// Job dependencies form a cycle
    CyclicDependency,
    /// The definition file could not be read
    Io,
}

impl DefinitionError {
    pub fn new(kind: DefinitionErrorKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: 0,
            column: 0,
            context: String::new(),
            suggestion: None,
            kind,
        }
    }

    pub fn invalid_schema(message: impl Into<String>) -> Self {
        Self::new(DefinitionErrorKind::InvalidSchema, message)
    }

    pub fn duplicate_job(name: &str) -> Self {
        Self::new(
            DefinitionErrorKind::DuplicateJob,
            format!("job '{}' is defined more than once", name),
        )
    }

    pub fn unknown_dependency(job: &str, dependency: &str) -> Self {
        Self::new(
            DefinitionErrorKind::UnknownDependency,
            format!("job '{}' needs unknown job '{}'", job, dependency),
        )
    }

    pub fn cyclic(jobs: &[&str]) -> Self {
        Self::new(
            DefinitionErrorKind::CyclicDependency,
            format!("circular dependency detected among jobs: {}", jobs.join(", ")),
        )
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(DefinitionErrorKind::Io, message)
    }

    pub fn at(mut self, line: usize, column: usize) -> Self {
        self.line = line;
        self.column = column;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    fn with_suggestion_opt(mut self, suggestion: Option<String>) -> Self {
        self.suggestion = suggestion;
        self
    }

    /// Attach the source lines surrounding the error position
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let prefix = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", prefix, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column + 7) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Create from a serde_yaml error
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let kind = if err.to_string().contains("invalid type")
            || err.to_string().contains("missing field")
            || err.to_string().contains("unknown field")
            || err.to_string().contains("unknown variant")
            || err.to_string().contains("did not match any variant")
        {
            DefinitionErrorKind::InvalidSchema
        } else {
            DefinitionErrorKind::YamlSyntax
        };

        let suggestion = suggest_fix(source, line, &err.to_string());

        Self::new(kind, format_yaml_error_message(err))
            .at(line, column)
            .with_source_context(source, 2)
            .with_suggestion_opt(suggestion)
    }
}

impl fmt::Display for DefinitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;

        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            write!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for DefinitionError {}

/// Turn serde_yaml's messages into something shorter
fn format_yaml_error_message(err: &serde_yaml::Error) -> String {
    let msg = err.to_string();

    if let Some(field) = extract_between(&msg, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }

    if let Some(field) = extract_between(&msg, "unknown field `", "`") {
        return format!("unknown field '{}'", field);
    }

    // serde_yaml appends " at line X column Y"; the position is reported separately
    match msg.find(" at line ") {
        Some(idx) => msg[..idx].to_string(),
        None => msg,
    }
}

fn extract_between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

/// Suggest fixes for keys people commonly spell the wrong way
fn suggest_fix(source: &str, line: usize, message: &str) -> Option<String> {
    let error_line = if line > 0 {
        source.lines().nth(line - 1).unwrap_or("")
    } else {
        ""
    };

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation. Replace tabs with spaces.".to_string());
    }

    let typo_suggestions = [
        ("depends_on", "needs"),
        ("dependson", "needs"),
        ("runs_on", "runs-on"),
        ("timeout_minutes", "timeout-minutes"),
        ("timeout:", "timeout-minutes"),
        ("continue_on_error", "continue-on-error"),
        ("working_directory", "working-directory"),
        ("cache_restore", "cache-restore"),
        ("cache_save", "cache-save"),
    ];

    let haystack = match extract_between(message, "unknown field `", "`") {
        Some(field) => format!("{}:", field.to_lowercase()),
        None => error_line.to_lowercase(),
    };
    typo_suggestions
        .iter()
        .find(|(typo, _)| haystack.contains(typo))
        .map(|(_, correct)| format!("did you mean '{}'?", correct))
}
