//! # Fragment files
//!
//! Everything the loader needs to know about a fragment script without running
//! it: where it lives, which fragments it declares as prerequisites, and the
//! top-level statements it contains.
//!
//! The scanner is deliberately shallow. It tracks braces, quotes and comments
//! well enough to find top-level `function` blocks, alias definitions,
//! `Register-FragmentCommand` calls, `$global:` markers and a top-level
//! `throw`. Anything else is carried along as opaque script text.

use crate::{
    constants::FRAGMENT_EXTENSION,
    models::{CommandType, ExportedCommand},
};
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

lazy_static! {
    static ref REQUIRES_RE: Regex =
        Regex::new(r"(?i)^\s*#?\s*Requires\s*:\s*(.*?)\s*$").expect("valid regex");
    static ref FUNCTION_RE: Regex =
        Regex::new(r"(?i)^\s*function\s+(?:global:|script:)?([A-Za-z0-9_.\-]+)").expect("valid regex");
    static ref ALIAS_RE: Regex =
        Regex::new(r"(?i)^\s*(?:Set|New)-Alias\s+(.+?)\s*;?\s*$").expect("valid regex");
    static ref REGISTER_RE: Regex =
        Regex::new(r"(?i)^\s*Register-FragmentCommand\s+(.+?)\s*;?\s*$").expect("valid regex");
    static ref GLOBAL_RE: Regex =
        Regex::new(r"(?i)^\s*\$global:([A-Za-z0-9_]+)\s*=\s*(.*?)\s*;?\s*$").expect("valid regex");
    static ref THROW_RE: Regex = Regex::new(r"(?i)^\s*throw\b\s*(.*?)\s*;?\s*$").expect("valid regex");
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScanError {
    #[error("function '{name}' starting on line {line} is never closed")]
    UnterminatedFunction { name: String, line: usize },
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },
}

/// A top-level statement found in a fragment script, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Function { name: String, body: String },
    Alias { name: String, target: String },
    Register {
        commands: Vec<String>,
        fragment: Option<String>,
        command_type: CommandType,
    },
    Global { name: String, value: String },
    Throw { message: String },
}

/// Fragment names are plain file stems: no separators, no parent references.
pub fn is_valid_fragment_name(name: &str) -> bool {
    let name = name.trim();
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', ':'])
        && !name.contains("..")
}

/// Joins the profile directory and `<fragment_name>.ps1`. Never checks existence.
pub fn fragment_path(profile_dir: &Path, fragment_name: &str) -> PathBuf {
    profile_dir.join(format!("{}.{}", fragment_name.trim(), FRAGMENT_EXTENSION))
}

/// Reads the `# Requires:` declaration of the fragment at `path`.
///
/// Returns an empty list if the path is missing or empty, the file cannot be
/// read, or it declares nothing. The fragment's own name is never returned.
pub fn fragment_dependencies(fragment_name: &str, path: Option<&Path>) -> Vec<String> {
    let Some(path) = path.filter(|p| !p.as_os_str().is_empty()) else {
        return Vec::new();
    };
    match fs::read_to_string(path) {
        Ok(content) => {
            let mut deps = parse_requires(&content);
            deps.retain(|d| !d.eq_ignore_ascii_case(fragment_name));
            deps
        }
        Err(e) => {
            log::trace!("No dependencies for '{}': {}", path.display(), e);
            Vec::new()
        }
    }
}

/// Parses `# Requires: a, b` lines from the leading comment block of a script.
///
/// Scanning stops at the first line of code. Several declarations are merged
/// in order and duplicates dropped. PowerShell's own `#Requires -Version`
/// directive has no colon and is not matched.
pub fn parse_requires(content: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    let mut in_block_comment = false;

    for line in content.lines() {
        let trimmed = line.trim();
        let is_comment = if in_block_comment {
            if trimmed.contains("#>") {
                in_block_comment = false;
            }
            true
        } else if trimmed.starts_with("<#") {
            in_block_comment = !trimmed.contains("#>");
            true
        } else {
            trimmed.is_empty() || trimmed.starts_with('#')
        };
        if !is_comment {
            break;
        }

        let candidate = trimmed.trim_start_matches("<#").trim_end_matches("#>");
        if let Some(caps) = REQUIRES_RE.captures(candidate) {
            let list = caps.get(1).map_or("", |m| m.as_str());
            for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if !deps.iter().any(|d| d.eq_ignore_ascii_case(name)) {
                    deps.push(name.to_string());
                }
            }
        }
    }
    deps
}

/// Counts `{` and `}` outside strings and line comments.
fn count_braces(line: &str) -> (i32, i32) {
    let mut opens = 0;
    let mut closes = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '`' if in_double => {
                chars.next();
            }
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' if !in_single && !in_double => break,
            '{' if !in_single && !in_double => opens += 1,
            '}' if !in_single && !in_double => closes += 1,
            _ => {}
        }
    }
    (opens, closes)
}

fn unquote(value: &str) -> String {
    let v = value.trim();
    let stripped = v
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    stripped.unwrap_or(v).to_string()
}

/// Splits a cmdlet argument string into named (`-Name value`) and positional
/// arguments. Parameter names are lowercased.
fn parse_cmdlet_args(args: &str, line: usize) -> Result<(Vec<(String, String)>, Vec<String>), ScanError> {
    let tokens = shlex::split(args).ok_or_else(|| ScanError::Malformed {
        line,
        message: format!("unbalanced quotes in '{}'", args),
    })?;
    let mut named = Vec::new();
    let mut positional = Vec::new();
    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        if let Some(param) = token.strip_prefix('-').filter(|p| !p.is_empty()) {
            let value = match iter.peek() {
                Some(next) if !next.starts_with('-') => iter.next().unwrap_or_default(),
                _ => String::new(),
            };
            named.push((param.to_ascii_lowercase(), value));
        } else {
            positional.push(token);
        }
    }
    Ok((named, positional))
}

fn named_arg<'a>(named: &'a [(String, String)], keys: &[&str]) -> Option<&'a str> {
    named
        .iter()
        .find(|(k, _)| keys.contains(&k.as_str()))
        .map(|(_, v)| v.as_str())
}

fn parse_command_type(value: &str) -> CommandType {
    match value.to_ascii_lowercase().as_str() {
        "alias" => CommandType::Alias,
        "cmdlet" => CommandType::Cmdlet,
        _ => CommandType::Function,
    }
}

fn parse_alias(args: &str, line: usize) -> Result<Statement, ScanError> {
    let (named, positional) = parse_cmdlet_args(args, line)?;
    let mut positional = positional.into_iter();
    let name = named_arg(&named, &["name", "n"])
        .map(str::to_string)
        .or_else(|| positional.next());
    let target = named_arg(&named, &["value", "v"])
        .map(str::to_string)
        .or_else(|| positional.next());
    match (name, target) {
        (Some(name), Some(target)) if !name.is_empty() => Ok(Statement::Alias { name, target }),
        _ => Err(ScanError::Malformed {
            line,
            message: "alias definition needs a name and a value".to_string(),
        }),
    }
}

fn parse_register(args: &str, line: usize) -> Result<Statement, ScanError> {
    let (named, positional) = parse_cmdlet_args(args, line)?;
    let mut positional = positional.into_iter();
    let names = named_arg(&named, &["commandname", "name"])
        .map(str::to_string)
        .or_else(|| positional.next())
        .unwrap_or_default();
    let commands: Vec<String> = names
        .split(',')
        .map(unquote)
        .filter(|n| !n.is_empty())
        .collect();
    if commands.is_empty() {
        return Err(ScanError::Malformed {
            line,
            message: "Register-FragmentCommand needs a command name".to_string(),
        });
    }
    let fragment = named_arg(&named, &["fragmentname", "fragment"])
        .map(str::to_string)
        .or_else(|| positional.next())
        .filter(|f| !f.is_empty());
    let command_type = named_arg(&named, &["commandtype", "type"])
        .map(parse_command_type)
        .unwrap_or_default();
    Ok(Statement::Register {
        commands,
        fragment,
        command_type,
    })
}

/// Scans a fragment script into its top-level statements.
///
/// # Errors
/// Fails on a `function` block that is never closed, or on an alias or
/// registration line whose arguments cannot be parsed.
pub fn scan_script(content: &str) -> Result<Vec<Statement>, ScanError> {
    let mut statements = Vec::new();
    let mut depth: i32 = 0;
    let mut in_block_comment = false;
    // (name, first line, collected lines, saw an opening brace)
    let mut open_function: Option<(String, usize, Vec<&str>, bool)> = None;

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();

        if in_block_comment {
            if trimmed.contains("#>") {
                in_block_comment = false;
            }
            continue;
        }
        if trimmed.starts_with("<#") {
            in_block_comment = !trimmed.contains("#>");
            continue;
        }

        let (opens, closes) = count_braces(line);

        if let Some((name, start, mut body, mut opened)) = open_function.take() {
            body.push(line);
            depth += opens - closes;
            opened |= opens > 0;
            if opened && depth <= 0 {
                statements.push(Statement::Function {
                    name,
                    body: body.join("\n"),
                });
                depth = 0;
            } else {
                open_function = Some((name, start, body, opened));
            }
            continue;
        }

        if depth > 0 {
            // Inside some other top-level block (if/foreach/...): not our business.
            depth = (depth + opens - closes).max(0);
            continue;
        }

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        if let Some(caps) = FUNCTION_RE.captures(line) {
            let name = caps.get(1).map_or("", |m| m.as_str()).to_string();
            depth = opens - closes;
            if opens > 0 && depth <= 0 {
                statements.push(Statement::Function {
                    name,
                    body: line.to_string(),
                });
                depth = 0;
            } else {
                open_function = Some((name, line_no, vec![line], opens > 0));
            }
            continue;
        }

        if let Some(caps) = ALIAS_RE.captures(line) {
            statements.push(parse_alias(caps.get(1).map_or("", |m| m.as_str()), line_no)?);
        } else if let Some(caps) = REGISTER_RE.captures(line) {
            statements.push(parse_register(caps.get(1).map_or("", |m| m.as_str()), line_no)?);
        } else if let Some(caps) = GLOBAL_RE.captures(line) {
            statements.push(Statement::Global {
                name: caps.get(1).map_or("", |m| m.as_str()).to_string(),
                value: unquote(caps.get(2).map_or("", |m| m.as_str())),
            });
        } else if let Some(caps) = THROW_RE.captures(line) {
            statements.push(Statement::Throw {
                message: unquote(caps.get(1).map_or("", |m| m.as_str())),
            });
        }
        depth = (opens - closes).max(0);
    }

    if let Some((name, line, _, _)) = open_function {
        return Err(ScanError::UnterminatedFunction { name, line });
    }
    Ok(statements)
}

/// The commands a script would define if sourced: its functions and aliases,
/// plus anything it registers on its own behalf.
pub fn exported_commands(statements: &[Statement]) -> Vec<ExportedCommand> {
    let mut exported: Vec<ExportedCommand> = Vec::new();
    let mut push = |name: &str, command_type: CommandType| {
        if !exported.iter().any(|e| e.name.eq_ignore_ascii_case(name)) {
            exported.push(ExportedCommand {
                name: name.to_string(),
                command_type,
            });
        }
    };
    for statement in statements {
        match statement {
            Statement::Function { name, .. } => push(name, CommandType::Function),
            Statement::Alias { name, .. } => push(name, CommandType::Alias),
            Statement::Register {
                commands,
                fragment: None,
                command_type,
            } => commands.iter().for_each(|c| push(c, *command_type)),
            _ => {}
        }
    }
    exported
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIT_FRAGMENT: &str = r#"# git.ps1
# Requires: bootstrap, env
# Requires: env, utilities
#Requires -Version 7.0

function Invoke-Git {
    param([string[]]$Args)
    if ($Args) { & git @Args }
    # a stray } in a comment
    Write-Output "braces in strings: { }"
}

function gst { Invoke-Git status }
Set-Alias -Name g -Value Invoke-Git
New-Alias gl Invoke-GitLog
Register-FragmentCommand -CommandName 'Invoke-GitLog' -CommandType Function
$global:GitFragmentLoaded = $true
"#;

    #[test]
    fn test_fragment_path_joins_dir_and_extension() {
        let path = fragment_path(Path::new("/p/profile.d"), "git");
        assert_eq!(path, PathBuf::from("/p/profile.d/git.ps1"));
    }

    #[test]
    fn test_fragment_name_validation() {
        assert!(is_valid_fragment_name("cloud-aws"));
        assert!(is_valid_fragment_name("00-bootstrap"));
        assert!(!is_valid_fragment_name(""));
        assert!(!is_valid_fragment_name("../etc/passwd"));
        assert!(!is_valid_fragment_name("a/b"));
        assert!(!is_valid_fragment_name("C:evil"));
    }

    #[test]
    fn test_parse_requires_merges_in_order() {
        assert_eq!(
            parse_requires(GIT_FRAGMENT),
            vec!["bootstrap", "env", "utilities"]
        );
    }

    #[test]
    fn test_parse_requires_stops_at_first_code_line() {
        let content = "function A {}\n# Requires: late\n";
        assert!(parse_requires(content).is_empty());
    }

    #[test]
    fn test_parse_requires_inside_block_comment() {
        let content = "<#\n  Requires: bootstrap\n#>\nfunction A {}\n";
        assert_eq!(parse_requires(content), vec!["bootstrap"]);
    }

    #[test]
    fn test_dependencies_of_missing_or_empty_path() {
        assert!(fragment_dependencies("x", None).is_empty());
        assert!(fragment_dependencies("x", Some(Path::new(""))).is_empty());
        assert!(fragment_dependencies("x", Some(Path::new("/definitely/not/here.ps1"))).is_empty());
    }

    #[test]
    fn test_dependencies_exclude_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("git.ps1");
        fs::write(&path, "# Requires: git, bootstrap\n").unwrap();
        assert_eq!(fragment_dependencies("git", Some(&path)), vec!["bootstrap"]);
    }

    #[test]
    fn test_scan_finds_top_level_statements() {
        let statements = scan_script(GIT_FRAGMENT).unwrap();
        let names: Vec<String> = exported_commands(&statements)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["Invoke-Git", "gst", "g", "gl", "Invoke-GitLog"]);

        assert!(statements.contains(&Statement::Global {
            name: "GitFragmentLoaded".into(),
            value: "$true".into()
        }));
        let Statement::Function { body, .. } = &statements[0] else {
            panic!("expected a function first");
        };
        assert!(body.contains("braces in strings"));
        assert!(body.trim_end().ends_with('}'));
    }

    #[test]
    fn test_scan_function_with_brace_on_next_line() {
        let statements = scan_script("function Get-Thing\n{\n  1\n}\n").unwrap();
        assert!(matches!(&statements[0], Statement::Function { name, .. } if name == "Get-Thing"));
    }

    #[test]
    fn test_scan_ignores_nested_statements() {
        let content = "if ($x) {\n  function Hidden {}\n  throw 'inner'\n}\n";
        assert!(scan_script(content).unwrap().is_empty());
    }

    #[test]
    fn test_scan_top_level_throw() {
        let statements = scan_script("function A {}\nthrow \"broken fragment\"\n").unwrap();
        assert_eq!(
            statements[1],
            Statement::Throw {
                message: "broken fragment".into()
            }
        );
    }

    #[test]
    fn test_scan_unterminated_function_fails() {
        let result = scan_script("function Broken {\n  1\n");
        assert_eq!(
            result,
            Err(ScanError::UnterminatedFunction {
                name: "Broken".into(),
                line: 1
            })
        );
    }

    #[test]
    fn test_register_for_other_fragment_is_not_exported() {
        let statements =
            scan_script("Register-FragmentCommand -CommandName 'Invoke-Aws,aws' -FragmentName cloud-aws\n")
                .unwrap();
        assert_eq!(
            statements[0],
            Statement::Register {
                commands: vec!["Invoke-Aws".into(), "aws".into()],
                fragment: Some("cloud-aws".into()),
                command_type: CommandType::Function,
            }
        );
        assert!(exported_commands(&statements).is_empty());
    }

    #[test]
    fn test_block_comments_are_skipped() {
        let content = "<#\nfunction NotReal {}\n#>\nfunction Real {}\n";
        let statements = scan_script(content).unwrap();
        assert_eq!(statements.len(), 1);
    }
}
