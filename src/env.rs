//! Environment composition for replicas and exported processes.
//!
//! A supervised replica sees the inherited environment, overridden by the
//! env-file variables, overridden by its computed `PORT`. Variables written
//! inline in a Procfile command are not injected into the child; only the
//! exporters turn them into declarations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::parser::{parse_inline_variables, OrderedMap, LINE_SEPARATORS};

/// Reads the env-file layer.
///
/// With an explicit list, every existing file is read in order and the
/// contents are joined with newlines; a missing or unreadable file is logged
/// and contributes nothing. Without a list, `<working_dir>/.env` is used when
/// present.
pub async fn load_env_files(env_files: Option<&[PathBuf]>, working_dir: &Path) -> OrderedMap<String> {
    let mut content = String::new();
    match env_files {
        Some(files) => {
            for path in files {
                match tokio::fs::read_to_string(path).await {
                    Ok(text) => {
                        content.push_str(&text);
                        content.push('\n');
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!("[forewoman] env file {} not found", path.display());
                    }
                    Err(err) => {
                        tracing::error!("[forewoman] Error reading env file {}: {}", path.display(), err);
                    }
                }
            }
        }
        None => {
            let path = working_dir.join(".env");
            if let Ok(text) = tokio::fs::read_to_string(&path).await {
                content = text;
            }
        }
    }
    parse_env_content(&content)
}

/// Parses `KEY=VALUE` lines; lines without exactly one `=` are ignored.
///
/// When a key repeats, the first occurrence wins.
pub fn parse_env_content(content: &str) -> OrderedMap<String> {
    let mut vars = OrderedMap::new();
    for line in content.split(LINE_SEPARATORS) {
        let parts: Vec<&str> = line.split('=').collect();
        if let [key, value] = parts.as_slice() {
            if !vars.contains_key(key) {
                vars.insert(*key, value.to_string());
            }
        }
    }
    vars
}

/// Builds a replica's environment without touching `base`.
pub fn resolve_env(
    base: &HashMap<String, String>,
    file_vars: &OrderedMap<String>,
    port: u32,
) -> HashMap<String, String> {
    let mut env = base.clone();
    for (key, value) in file_vars.iter() {
        env.insert(key.to_string(), value.clone());
    }
    env.insert("PORT".to_string(), port.to_string());
    env
}

/// Variables declared for an exported process: `PORT`, then the env files,
/// then variables written inline in the command.
pub fn export_env(port: u32, file_vars: &OrderedMap<String>, command: &str) -> OrderedMap<String> {
    let mut vars = OrderedMap::new();
    vars.insert("PORT", port.to_string());
    for (key, value) in file_vars.iter() {
        vars.insert(key, value.clone());
    }
    for (key, value) in parse_inline_variables(command).iter() {
        vars.insert(key, value.clone());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            ("HOME".to_string(), "/home/app".to_string()),
            ("PORT".to_string(), "80".to_string()),
            ("SERVER_MSG".to_string(), "inherited".to_string()),
        ])
    }

    #[test]
    fn parses_env_lines_with_a_single_equals() {
        let vars = parse_env_content("SERVER_MSG=I am the server. I listen to port:\nBAD\nA=b=c\n\nX=1");
        assert_eq!(
            vars.get("SERVER_MSG").map(String::as_str),
            Some("I am the server. I listen to port:")
        );
        assert_eq!(vars.get("X").map(String::as_str), Some("1"));
        assert_eq!(vars.len(), 2);
    }

    #[test]
    fn first_occurrence_of_a_duplicate_key_wins() {
        let vars = parse_env_content("KEY=first\nKEY=second");
        assert_eq!(vars.get("KEY").map(String::as_str), Some("first"));
    }

    #[test]
    fn layers_file_vars_then_port_over_base() {
        let base = base_env();
        let file_vars = parse_env_content("SERVER_MSG=from file\nPORT=9999");
        let env = resolve_env(&base, &file_vars, 5002);
        assert_eq!(env["SERVER_MSG"], "from file");
        assert_eq!(env["PORT"], "5002");
        assert_eq!(env["HOME"], "/home/app");
    }

    #[test]
    fn resolving_never_mutates_the_base() {
        let base = base_env();
        let before = base.clone();
        let file_vars = parse_env_content("SERVER_MSG=changed\nNEW=1");
        let first = resolve_env(&base, &file_vars, 5000);
        let second = resolve_env(&base, &file_vars, 5001);
        assert_eq!(base, before);
        assert_eq!(first["PORT"], "5000");
        assert_eq!(second["PORT"], "5001");
    }

    #[test]
    fn inline_command_variables_are_not_injected_into_children() {
        let file_vars = OrderedMap::new();
        let env = resolve_env(&HashMap::new(), &file_vars, 5000);
        let command = "FOO=1 node server.js";
        assert!(!env.contains_key("FOO"));
        let exported = export_env(5000, &file_vars, command);
        assert_eq!(exported.get("FOO").map(String::as_str), Some("1"));
    }

    #[test]
    fn export_env_layers_inline_over_files_over_port() {
        let file_vars = parse_env_content("PORT=7000\nMODE=file\nOTHER=x");
        let vars = export_env(5000, &file_vars, "MODE=inline node app.js");
        let pairs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (k, v.as_str())).collect();
        assert_eq!(
            pairs,
            vec![("PORT", "7000"), ("MODE", "inline"), ("OTHER", "x")]
        );
    }

    #[tokio::test]
    async fn explicit_env_files_are_concatenated_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.env");
        let second = dir.path().join("second.env");
        std::fs::write(&first, "A=1\nSHARED=first").unwrap();
        std::fs::write(&second, "SHARED=second\nB=2").unwrap();
        let files = vec![first, dir.path().join("missing.env"), second];

        let vars = load_env_files(Some(files.as_slice()), dir.path()).await;
        assert_eq!(vars.get("A").map(String::as_str), Some("1"));
        assert_eq!(vars.get("B").map(String::as_str), Some("2"));
        assert_eq!(vars.get("SHARED").map(String::as_str), Some("first"));
    }

    #[tokio::test]
    async fn falls_back_to_dot_env_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_files(None, dir.path()).await.is_empty());

        std::fs::write(dir.path().join(".env"), "SERVER_MSG=hello").unwrap();
        let vars = load_env_files(None, dir.path()).await;
        assert_eq!(vars.get("SERVER_MSG").map(String::as_str), Some("hello"));
    }
}
