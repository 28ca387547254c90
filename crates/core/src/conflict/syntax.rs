//! Pluggable syntax validation for proposed resolutions.
//!
//! Checks are shallow: they catch truncated or mangled output
//! (unbalanced brackets, unterminated strings, empty blocks) without trying to
//! understand the language.

use std::path::Path;

/// A syntax validator for one language family.
pub trait SyntaxCheck: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// `Err(detail)` if `content` is not plausibly valid.
    fn check(&self, content: &str) -> Result<(), String>;
}

/// Pick the validator for a file, by extension. `None` means "no check".
pub fn checker_for(file_path: &str) -> Option<Box<dyn SyntaxCheck>> {
    let ext = Path::new(file_path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())?;
    let checker: Box<dyn SyntaxCheck> = match ext.as_str() {
        "json" => Box::new(JsonCheck),
        "toml" => Box::new(TomlCheck),
        "yaml" | "yml" => Box::new(YamlLiteCheck),
        "py" => Box::new(PythonCheck),
        "rs" => Box::new(BraceCheck::rust()),
        "js" | "jsx" | "ts" | "tsx" => Box::new(BraceCheck::javascript()),
        "c" | "h" | "cpp" | "hpp" | "cc" | "java" | "go" | "cs" | "kt" | "swift" | "css"
        | "scss" => Box::new(BraceCheck::c_like()),
        "php" => Box::new(BraceCheck::php()),
        _ => return None,
    };
    Some(checker)
}

/// Language name used in resolver prompts.
pub fn language_for(file_path: &str) -> &'static str {
    let ext = Path::new(file_path)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "cpp" => "cpp",
        "c" | "h" => "c",
        "go" => "go",
        "rs" => "rust",
        "php" => "php",
        "rb" => "ruby",
        "sh" => "bash",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "xml" => "xml",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        "md" => "markdown",
        _ => "text",
    }
}

// ---------------------------------------------------------------------------
// Structured formats
// ---------------------------------------------------------------------------

pub struct JsonCheck;

impl SyntaxCheck for JsonCheck {
    fn name(&self) -> &'static str {
        "json"
    }

    fn check(&self, content: &str) -> Result<(), String> {
        serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

pub struct TomlCheck;

impl SyntaxCheck for TomlCheck {
    fn name(&self) -> &'static str {
        "toml"
    }

    fn check(&self, content: &str) -> Result<(), String> {
        content
            .parse::<toml::Table>()
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Indentation and flow-collection balance only.
pub struct YamlLiteCheck;

impl SyntaxCheck for YamlLiteCheck {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn check(&self, content: &str) -> Result<(), String> {
        for (idx, line) in content.lines().enumerate() {
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            if indent.contains('\t') {
                return Err(format!("line {}: tab in indentation", idx + 1));
            }
        }
        // Plain scalars may contain apostrophes, so only double quotes delimit.
        let scanner = Scanner {
            single_quote_strings: false,
            backtick_strings: false,
            slash_comments: false,
            hash_comments: true,
            triple_quotes: false,
        };
        scanner.balance(content)
    }
}

// ---------------------------------------------------------------------------
// Bracket and string balance
// ---------------------------------------------------------------------------

/// Bracket and string balance for brace languages.
pub struct BraceCheck {
    name: &'static str,
    scanner: Scanner,
}

impl BraceCheck {
    pub fn rust() -> Self {
        // Single quotes are lifetimes as often as char literals.
        Self {
            name: "rust",
            scanner: Scanner {
                single_quote_strings: false,
                backtick_strings: false,
                slash_comments: true,
                hash_comments: false,
                triple_quotes: false,
            },
        }
    }

    pub fn javascript() -> Self {
        Self {
            name: "javascript",
            scanner: Scanner {
                single_quote_strings: true,
                backtick_strings: true,
                slash_comments: true,
                hash_comments: false,
                triple_quotes: false,
            },
        }
    }

    pub fn c_like() -> Self {
        Self {
            name: "c-like",
            scanner: Scanner {
                single_quote_strings: true,
                backtick_strings: false,
                slash_comments: true,
                hash_comments: false,
                triple_quotes: false,
            },
        }
    }

    pub fn php() -> Self {
        Self {
            name: "php",
            scanner: Scanner {
                single_quote_strings: true,
                backtick_strings: false,
                slash_comments: true,
                hash_comments: true,
                triple_quotes: false,
            },
        }
    }
}

impl SyntaxCheck for BraceCheck {
    fn name(&self) -> &'static str {
        self.name
    }

    fn check(&self, content: &str) -> Result<(), String> {
        self.scanner.balance(content)
    }
}

#[derive(Debug, Clone, Copy)]
struct Scanner {
    single_quote_strings: bool,
    backtick_strings: bool,
    slash_comments: bool,
    hash_comments: bool,
    triple_quotes: bool,
}

impl Scanner {
    fn balance(&self, content: &str) -> Result<(), String> {
        let chars: Vec<char> = content.chars().collect();
        let mut stack: Vec<(char, usize)> = Vec::new();
        let mut line = 1usize;
        let mut i = 0usize;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if c == '\n' {
                line += 1;
                i += 1;
                continue;
            }
            if (self.hash_comments && c == '#') || (self.slash_comments && c == '/' && next == Some('/')) {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            if self.slash_comments && c == '/' && next == Some('*') {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err(format!("line {}: unterminated block comment", start)),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        _ => {}
                    }
                    i += 1;
                }
                continue;
            }

            let is_quote = c == '"'
                || (self.single_quote_strings && c == '\'')
                || (self.backtick_strings && c == '`');
            if is_quote {
                let triple = self.triple_quotes
                    && chars.get(i + 1) == Some(&c)
                    && chars.get(i + 2) == Some(&c);
                let start = line;
                i = if triple { i + 3 } else { i + 1 };
                loop {
                    match chars.get(i) {
                        None => return Err(format!("line {}: unterminated string", start)),
                        Some('\\') => i += 1,
                        Some('\n') => {
                            if !triple && c != '`' {
                                return Err(format!("line {}: unterminated string", start));
                            }
                            line += 1;
                        }
                        Some(q) if *q == c => {
                            if !triple {
                                i += 1;
                                break;
                            }
                            if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                                i += 3;
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                continue;
            }

            match c {
                '(' | '[' | '{' => stack.push((c, line)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {}
                        Some((open, open_line)) => {
                            return Err(format!(
                                "line {}: '{}' closes '{}' opened on line {}",
                                line, c, open, open_line
                            ))
                        }
                        None => return Err(format!("line {}: unmatched '{}'", line, c)),
                    }
                }
                _ => {}
            }
            i += 1;
        }

        match stack.pop() {
            Some((open, open_line)) => Err(format!("line {}: unclosed '{}'", open_line, open)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Python
// ---------------------------------------------------------------------------

const PY_BLOCK_KEYWORDS: &[&str] = &[
    "def", "async", "class", "if", "elif", "else", "for", "while", "try", "except", "finally",
    "with", "match", "case",
];

/// Bracket/string balance plus block structure: every block header must be
/// followed by a more-indented body.
pub struct PythonCheck;

impl SyntaxCheck for PythonCheck {
    fn name(&self) -> &'static str {
        "python"
    }

    fn check(&self, content: &str) -> Result<(), String> {
        let scanner = Scanner {
            single_quote_strings: true,
            backtick_strings: false,
            slash_comments: false,
            hash_comments: true,
            triple_quotes: true,
        };
        scanner.balance(content)?;

        let code_lines: Vec<(usize, usize, &str)> = content
            .lines()
            .enumerate()
            .filter_map(|(idx, raw)| {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return None;
                }
                let indent = raw.len() - raw.trim_start().len();
                Some((idx + 1, indent, trimmed))
            })
            .collect();

        if let Some((line_no, indent, _)) = code_lines.first() {
            if *indent > 0 {
                return Err(format!("line {}: unexpected indent", line_no));
            }
        }

        for (pos, (line_no, indent, text)) in code_lines.iter().enumerate() {
            let first_word = text
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .next()
                .unwrap_or("");
            let code = text.split(" #").next().unwrap_or(text).trim_end();
            if !PY_BLOCK_KEYWORDS.contains(&first_word) || !code.ends_with(':') {
                continue;
            }
            match code_lines.get(pos + 1) {
                Some((_, next_indent, _)) if next_indent > indent => {}
                _ => {
                    return Err(format!(
                        "line {}: expected an indented block after '{}'",
                        line_no, first_word
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(path: &str, content: &str) -> Result<(), String> {
        checker_for(path).expect("checker").check(content)
    }

    #[test]
    fn test_json_and_toml() {
        assert!(check("a.json", r#"{"a": [1, 2]}"#).is_ok());
        assert!(check("a.json", r#"{"a": [1, 2}"#).is_err());
        assert!(check("Cargo.toml", "[package]\nname = \"x\"\n").is_ok());
        assert!(check("Cargo.toml", "[package\nname = \"x\"\n").is_err());
    }

    #[test]
    fn test_yaml_lite() {
        assert!(check("ci.yml", "jobs:\n  build:\n    steps: [a, b]\n").is_ok());
        assert!(check("ci.yml", "jobs:\n\tbuild: x\n").is_err());
        assert!(check("ci.yaml", "list: [a, b\n").is_err());
        assert!(check("ci.yaml", "note: it's fine\n").is_ok());
    }

    #[test]
    fn test_brace_languages() {
        assert!(check("lib.rs", "fn f<'a>(x: &'a str) -> &'a str { x }\n").is_ok());
        assert!(check("lib.rs", "fn f() { let s = \"}\"; \n").is_err());
        assert!(check("app.ts", "const s = `a ${b}`; // }\nfunction f() { return [1]; }\n").is_ok());
        assert!(check("main.c", "int main() { return 0; )\n").is_err());
        assert!(check("main.c", "/* unterminated").is_err());
    }

    #[test]
    fn test_python_structure() {
        let ok = "import os\n\n\ndef login(user):\n    if user:\n        return True\n    return False\n";
        assert!(check("auth.py", ok).is_ok());

        let empty_block = "def login(user):\nreturn True\n";
        assert!(check("auth.py", empty_block).is_err());

        let unbalanced = "x = call(1, 2\n";
        assert!(check("auth.py", unbalanced).is_err());

        let docstring = "def f():\n    \"\"\"Doc with ( paren.\"\"\"\n    return 1\n";
        assert!(check("auth.py", docstring).is_ok());

        let indented_start = "    x = 1\n";
        assert!(check("auth.py", indented_start).is_err());
    }

    #[test]
    fn test_unknown_extensions_are_unchecked() {
        assert!(checker_for("README").is_none());
        assert!(checker_for("notes.md").is_none());
        assert_eq!(language_for("notes.md"), "markdown");
        assert_eq!(language_for("Makefile"), "text");
    }
}
