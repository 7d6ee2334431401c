use crate::{config::ExecutorConfig, models::Language};

/// A program plus arguments. `{file}` and `{entry}` inside any argument are
/// replaced with the prepared source file name and entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn render(&self, source: &PreparedSource) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{file}", &source.file_name)
                    .replace("{entry}", &source.entry)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolchainKind {
    RunDirect,
    CompileThenRun { compile: CommandTemplate },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLayout {
    Fixed(String),
    JavaClass,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSource {
    pub file_name: String,
    pub contents: String,
    pub entry: String,
}

impl SourceLayout {
    pub fn prepare(&self, code: &str) -> PreparedSource {
        match self {
            SourceLayout::Fixed(file_name) => PreparedSource {
                file_name: file_name.clone(),
                contents: code.to_string(),
                entry: file_name.clone(),
            },
            SourceLayout::JavaClass => {
                let contents = if code.contains("class") {
                    code.to_string()
                } else {
                    wrap_in_main_class(code)
                };
                let entry = public_class_name(&contents).unwrap_or("Main").to_string();
                PreparedSource {
                    file_name: format!("{entry}.java"),
                    contents,
                    entry,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Toolchain {
    pub name: String,
    pub missing_message: String,
    pub probes: Vec<CommandTemplate>,
    pub layout: SourceLayout,
    pub kind: ToolchainKind,
    pub run: CommandTemplate,
}

impl Toolchain {
    pub fn go(go_bin: &str) -> Self {
        Self {
            name: "go".to_string(),
            missing_message: "Go is not installed on the server. Please install Go to enable Go code execution.".to_string(),
            probes: vec![CommandTemplate::new(go_bin, &["version"])],
            layout: SourceLayout::Fixed("main.go".to_string()),
            kind: ToolchainKind::RunDirect,
            run: CommandTemplate::new(go_bin, &["run", "{file}"]),
        }
    }

    pub fn java(java_bin: &str, javac_bin: &str) -> Self {
        Self {
            name: "java".to_string(),
            missing_message: "Java/JDK is not installed on the server. Please install JDK to enable Java code execution.".to_string(),
            probes: vec![
                CommandTemplate::new(java_bin, &["-version"]),
                CommandTemplate::new(javac_bin, &["-version"]),
            ],
            layout: SourceLayout::JavaClass,
            kind: ToolchainKind::CompileThenRun {
                compile: CommandTemplate::new(javac_bin, &["{file}"]),
            },
            run: CommandTemplate::new(java_bin, &["-cp", ".", "{entry}"]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolchainSet {
    go: Toolchain,
    java: Toolchain,
}

impl ToolchainSet {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            go: Toolchain::go(&config.go_bin),
            java: Toolchain::java(&config.java_bin, &config.javac_bin),
        }
    }

    pub fn for_language(&self, language: Language) -> Option<&Toolchain> {
        match language {
            Language::Go => Some(&self.go),
            Language::Java => Some(&self.java),
            Language::JavaScript | Language::Python => None,
        }
    }
}

fn wrap_in_main_class(body: &str) -> String {
    format!(
        "public class Main {{\n    public static void main(String[] args) {{\n        {body}\n    }}\n}}"
    )
}

// The name doubles as a file name, so anything that is not a plain Java
// identifier falls back to `Main`.
fn public_class_name(source: &str) -> Option<&str> {
    const MARKER: &str = "public class";
    let start = source.find(MARKER)? + MARKER.len();
    let end = start + source[start..].find('{')?;
    source[start..end]
        .split_whitespace()
        .next()
        .filter(|name| {
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        })
}
