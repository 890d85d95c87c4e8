//! Dockerfile parser.
//!
//! Parses rendered Dockerfile text into a typed instruction list grouped
//! into build stages. Beyond the standard instruction set this recognizes
//! the tplbuild-specific `END` (close the current stage without starting a
//! new one), `PUSHCONTEXT` and `POPCONTEXT` (rebind the stage build context
//! for subsequent instructions).
//!
//! Heredocs and `# syntax=` frontends are out of scope; the `syntax`
//! directive is recorded but informational, while `escape` changes the
//! line-continuation character.

use std::collections::HashSet;

/// Instruction verb. `Unknown` is only produced in non-strict mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    From,
    Copy,
    Add,
    Run,
    Cmd,
    Entrypoint,
    Env,
    Arg,
    Label,
    Workdir,
    User,
    Expose,
    Volume,
    Shell,
    Onbuild,
    Healthcheck,
    Stopsignal,
    Maintainer,
    End,
    PushContext,
    PopContext,
    Unknown(String),
}

impl Verb {
    fn parse(word: &str) -> Option<Verb> {
        Some(match word.to_ascii_uppercase().as_str() {
            "FROM" => Verb::From,
            "COPY" => Verb::Copy,
            "ADD" => Verb::Add,
            "RUN" => Verb::Run,
            "CMD" => Verb::Cmd,
            "ENTRYPOINT" => Verb::Entrypoint,
            "ENV" => Verb::Env,
            "ARG" => Verb::Arg,
            "LABEL" => Verb::Label,
            "WORKDIR" => Verb::Workdir,
            "USER" => Verb::User,
            "EXPOSE" => Verb::Expose,
            "VOLUME" => Verb::Volume,
            "SHELL" => Verb::Shell,
            "ONBUILD" => Verb::Onbuild,
            "HEALTHCHECK" => Verb::Healthcheck,
            "STOPSIGNAL" => Verb::Stopsignal,
            "MAINTAINER" => Verb::Maintainer,
            "END" => Verb::End,
            "PUSHCONTEXT" => Verb::PushContext,
            "POPCONTEXT" => Verb::PopContext,
            _ => return None,
        })
    }

    /// Canonical verb text.
    pub fn name(&self) -> &str {
        match self {
            Verb::From => "FROM",
            Verb::Copy => "COPY",
            Verb::Add => "ADD",
            Verb::Run => "RUN",
            Verb::Cmd => "CMD",
            Verb::Entrypoint => "ENTRYPOINT",
            Verb::Env => "ENV",
            Verb::Arg => "ARG",
            Verb::Label => "LABEL",
            Verb::Workdir => "WORKDIR",
            Verb::User => "USER",
            Verb::Expose => "EXPOSE",
            Verb::Volume => "VOLUME",
            Verb::Shell => "SHELL",
            Verb::Onbuild => "ONBUILD",
            Verb::Healthcheck => "HEALTHCHECK",
            Verb::Stopsignal => "STOPSIGNAL",
            Verb::Maintainer => "MAINTAINER",
            Verb::End => "END",
            Verb::PushContext => "PUSHCONTEXT",
            Verb::PopContext => "POPCONTEXT",
            Verb::Unknown(word) => word,
        }
    }

    /// True for instructions that read files from the build context.
    pub fn consumes_context(&self) -> bool {
        matches!(self, Verb::Copy | Verb::Add)
    }

    /// True for the tplbuild stage-control pseudo instructions that never
    /// reach the builder.
    pub fn is_stage_control(&self) -> bool {
        matches!(self, Verb::End | Verb::PushContext | Verb::PopContext)
    }
}

/// A single parsed Dockerfile instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub verb: Verb,
    /// `--key=value` flags preceding the operands, in source order.
    /// Unknown flags are preserved verbatim and forwarded to the builder.
    pub flags: Vec<(String, String)>,
    /// Operand text following the flags.
    pub args: String,
    /// 1-based source line of the instruction.
    pub line: usize,
}

impl Instruction {
    /// Look up a flag value by key.
    pub fn flag(&self, key: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Canonical single-line form: verb uppercased, flags sorted by key,
    /// operands joined with single spaces, surrounding whitespace stripped.
    pub fn canonical(&self) -> String {
        let mut out = String::from(self.verb.name());
        let mut flags: Vec<&(String, String)> = self.flags.iter().collect();
        flags.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, value) in flags {
            out.push_str(&format!(" --{key}={value}"));
        }
        let args = self.args.split_whitespace().collect::<Vec<_>>().join(" ");
        if !args.is_empty() {
            out.push(' ');
            out.push_str(&args);
        }
        out
    }

    /// Copy of this instruction with one flag replaced (or inserted).
    pub fn with_flag(&self, key: &str, value: &str) -> Instruction {
        let mut inst = self.clone();
        match inst.flags.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value.to_string(),
            None => inst.flags.push((key.to_string(), value.to_string())),
        }
        inst
    }

    /// Copy of this instruction with one flag removed.
    pub fn without_flag(&self, key: &str) -> Instruction {
        let mut inst = self.clone();
        inst.flags.retain(|(k, _)| k != key);
        inst
    }
}

/// A contiguous run of instructions beginning with `FROM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Stage name: the `AS` name, or the stage index as a string.
    pub name: String,
    /// True if the name was given explicitly via `AS`.
    pub explicit_name: bool,
    /// The `FROM` operand: a prior stage name or an external image ref.
    pub base_ref: String,
    /// Flags given on the `FROM` line (e.g. `--platform`).
    pub from_flags: Vec<(String, String)>,
    /// Instructions following the `FROM` line, including stage-control
    /// pseudo instructions.
    pub instructions: Vec<Instruction>,
    /// True if the stage name carries a base prefix (`base-`/`base_`).
    pub base: bool,
    /// True if the stage name carries an anon prefix (`anon-`/`anon_`).
    pub anon: bool,
    /// 1-based source line of the `FROM`.
    pub line: usize,
}

/// Parse result: ordered stages plus recognized parser directives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    pub stages: Vec<Stage>,
    /// Value of a leading `# syntax=` directive, informational only.
    pub syntax: Option<String>,
    /// Line-continuation character, `\` unless changed by `# escape=`.
    pub escape: char,
}

impl Dockerfile {
    /// Re-emit every stage in canonical form. Feeding the result back to
    /// [`parse`] yields an equal instruction list.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        for stage in &self.stages {
            let mut from = String::from("FROM");
            let mut flags: Vec<&(String, String)> = stage.from_flags.iter().collect();
            flags.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, value) in flags {
                from.push_str(&format!(" --{key}={value}"));
            }
            from.push_str(&format!(" {}", stage.base_ref));
            if stage.explicit_name {
                from.push_str(&format!(" AS {}", stage.name));
            }
            out.push_str(&from);
            out.push('\n');
            for inst in &stage.instructions {
                out.push_str(&inst.canonical());
                out.push('\n');
            }
        }
        out
    }
}

/// Dockerfile parse error with source position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("parse error at line {line}:{col}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub col: usize,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    #[error("unterminated line continuation")]
    UnterminatedContinuation,
    #[error("instruction {verb} before any FROM")]
    InstructionBeforeFrom { verb: String },
    #[error("duplicate stage name {name:?}")]
    DuplicateStageName { name: String },
    #[error("unknown instruction {verb}")]
    UnknownInstruction { verb: String },
    #[error("malformed flag {flag:?}, expected --key=value")]
    MalformedFlag { flag: String },
    #[error("{verb} requires an argument")]
    MissingArgument { verb: String },
    #[error("unexpected argument after {verb}")]
    UnexpectedArgument { verb: String },
    #[error("instruction {verb} after END, expected FROM")]
    InstructionAfterEnd { verb: String },
}

impl ParseError {
    fn new(line: usize, col: usize, kind: ParseErrorKind) -> Self {
        Self { line, col, kind }
    }
}

/// Parser behavior switches.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Fail on unknown instruction verbs. When off, unknown verbs are
    /// preserved and forwarded to the builder verbatim.
    pub strict: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self { strict: true }
    }
}

/// Parse rendered Dockerfile text with default (strict) options.
pub fn parse(text: &str) -> Result<Dockerfile, ParseError> {
    parse_with(text, &ParseOptions::default())
}

/// Parse rendered Dockerfile text.
pub fn parse_with(text: &str, options: &ParseOptions) -> Result<Dockerfile, ParseError> {
    let (syntax, escape, body_start) = parse_directives(text);
    let lines = join_lines(text, escape, body_start)?;

    let mut parser = Parser {
        options,
        stages: Vec::new(),
        names: HashSet::new(),
        stage_open: false,
        stage_closed: false,
    };
    for (line_num, line) in lines {
        parser.feed(line_num, &line)?;
    }

    Ok(Dockerfile {
        stages: parser.stages,
        syntax,
        escape,
    })
}

/// Default prefixes marking a stage as a shared base image.
pub const BASE_PREFIXES: &[&str] = &["base-", "base_"];
/// Default prefixes marking a stage as anonymous scratchwork.
pub const ANON_PREFIXES: &[&str] = &["anon-", "anon_"];

/// True if `name` carries a base-stage prefix.
pub fn name_is_base(name: &str) -> bool {
    BASE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// True if `name` carries an anon-stage prefix.
pub fn name_is_anon(name: &str) -> bool {
    ANON_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Recognize leading `# key=value` parser directives. Returns the syntax
/// directive value, the effective escape character, and the index of the
/// first line after the directive block.
fn parse_directives(text: &str) -> (Option<String>, char, usize) {
    let mut syntax = None;
    let mut escape = '\\';
    let mut body_start = 0;

    for (idx, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if !trimmed.starts_with('#') {
            break;
        }
        let rest = trimmed[1..].trim();
        let Some((key, value)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            "syntax" => syntax = Some(value.to_string()),
            "escape" if value == "`" => escape = '`',
            "escape" => escape = '\\',
            _ => break,
        }
        body_start = idx + 1;
    }

    (syntax, escape, body_start)
}

/// Join physical lines into logical lines, honoring the continuation
/// character and dropping comment and blank lines.
fn join_lines(
    text: &str,
    escape: char,
    body_start: usize,
) -> Result<Vec<(usize, String)>, ParseError> {
    let mut result = Vec::new();
    let mut parts: Vec<String> = Vec::new();
    let mut start_line = 0;

    let raw_lines: Vec<&str> = text.lines().collect();
    for (idx, raw) in raw_lines.iter().enumerate().skip(body_start) {
        let line_num = idx + 1;
        let trimmed_end = raw.trim_end();

        // Comment lines are dropped, including inside a continuation.
        if trimmed_end.trim_start().starts_with('#') {
            continue;
        }

        let continued = if escape == '\\' {
            trimmed_end.ends_with('\\') && !trimmed_end.ends_with("\\\\")
        } else {
            trimmed_end.ends_with(escape)
        };

        if continued {
            if parts.is_empty() {
                start_line = line_num;
            }
            parts.push(trimmed_end[..trimmed_end.len() - 1].to_string());
            if idx + 1 == raw_lines.len() {
                return Err(ParseError::new(
                    line_num,
                    trimmed_end.len(),
                    ParseErrorKind::UnterminatedContinuation,
                ));
            }
            continue;
        }

        let line_num = if parts.is_empty() { line_num } else { start_line };
        let logical = format!("{}{}", parts.concat(), trimmed_end);
        parts.clear();
        let logical = logical.trim().to_string();
        if !logical.is_empty() {
            result.push((line_num, logical));
        }
    }

    // A continuation followed only by comment lines never terminated.
    if !parts.is_empty() {
        return Err(ParseError::new(
            start_line,
            1,
            ParseErrorKind::UnterminatedContinuation,
        ));
    }

    Ok(result)
}

struct Parser<'a> {
    options: &'a ParseOptions,
    stages: Vec<Stage>,
    names: HashSet<String>,
    stage_open: bool,
    stage_closed: bool,
}

impl Parser<'_> {
    fn feed(&mut self, line_num: usize, line: &str) -> Result<(), ParseError> {
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim_start()),
            None => (line, ""),
        };

        let verb = match Verb::parse(word) {
            Some(verb) => verb,
            None if self.options.strict => {
                return Err(ParseError::new(
                    line_num,
                    1,
                    ParseErrorKind::UnknownInstruction {
                        verb: word.to_string(),
                    },
                ));
            }
            None => Verb::Unknown(word.to_ascii_uppercase()),
        };

        if verb == Verb::From {
            return self.begin_stage(line_num, rest);
        }

        if !self.stage_open {
            let kind = if self.stage_closed {
                ParseErrorKind::InstructionAfterEnd {
                    verb: verb.name().to_string(),
                }
            } else {
                ParseErrorKind::InstructionBeforeFrom {
                    verb: verb.name().to_string(),
                }
            };
            return Err(ParseError::new(line_num, 1, kind));
        }

        let (flags, args) = split_flags(line_num, word.len() + 1, rest)?;

        match verb {
            Verb::End => {
                if !args.is_empty() {
                    return Err(ParseError::new(
                        line_num,
                        word.len() + 2,
                        ParseErrorKind::UnexpectedArgument {
                            verb: "END".to_string(),
                        },
                    ));
                }
                self.stage_open = false;
                self.stage_closed = true;
                return Ok(());
            }
            Verb::PushContext if args.is_empty() => {
                return Err(ParseError::new(
                    line_num,
                    word.len() + 2,
                    ParseErrorKind::MissingArgument {
                        verb: "PUSHCONTEXT".to_string(),
                    },
                ));
            }
            Verb::PopContext if !args.is_empty() => {
                return Err(ParseError::new(
                    line_num,
                    word.len() + 2,
                    ParseErrorKind::UnexpectedArgument {
                        verb: "POPCONTEXT".to_string(),
                    },
                ));
            }
            _ => {}
        }

        let stage = self.stages.last_mut().expect("stage_open implies a stage");
        stage.instructions.push(Instruction {
            verb,
            flags,
            args,
            line: line_num,
        });
        Ok(())
    }

    fn begin_stage(&mut self, line_num: usize, rest: &str) -> Result<(), ParseError> {
        let (flags, args) = split_flags(line_num, 6, rest)?;
        let operands: Vec<&str> = args.split_whitespace().collect();

        let (base_ref, explicit_name) = match operands.as_slice() {
            [image] => (image.to_string(), None),
            [image, kw, name] if kw.eq_ignore_ascii_case("as") => {
                (image.to_string(), Some(name.to_string()))
            }
            _ => {
                return Err(ParseError::new(
                    line_num,
                    6,
                    ParseErrorKind::MissingArgument {
                        verb: "FROM".to_string(),
                    },
                ));
            }
        };

        let name = explicit_name
            .clone()
            .unwrap_or_else(|| self.stages.len().to_string());
        if !self.names.insert(name.clone()) {
            return Err(ParseError::new(
                line_num,
                6,
                ParseErrorKind::DuplicateStageName { name },
            ));
        }

        self.stages.push(Stage {
            base: name_is_base(&name),
            anon: name_is_anon(&name),
            name,
            explicit_name: explicit_name.is_some(),
            base_ref,
            from_flags: flags,
            instructions: Vec::new(),
            line: line_num,
        });
        self.stage_open = true;
        self.stage_closed = false;
        Ok(())
    }
}

/// Split leading `--key=value` flags from the operand text.
fn split_flags(
    line_num: usize,
    mut col: usize,
    mut rest: &str,
) -> Result<(Vec<(String, String)>, String), ParseError> {
    let mut flags = Vec::new();
    loop {
        rest = rest.trim_start();
        if !rest.starts_with("--") {
            break;
        }
        let token = rest.split_whitespace().next().unwrap_or(rest);
        let Some((key, value)) = token[2..].split_once('=') else {
            return Err(ParseError::new(
                line_num,
                col,
                ParseErrorKind::MalformedFlag {
                    flag: token.to_string(),
                },
            ));
        };
        if key.is_empty() {
            return Err(ParseError::new(
                line_num,
                col,
                ParseErrorKind::MalformedFlag {
                    flag: token.to_string(),
                },
            ));
        }
        flags.push((key.to_string(), value.to_string()));
        col += token.len() + 1;
        rest = &rest[token.len()..];
    }
    Ok((flags, rest.trim().to_string()))
}
