use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use std::thread;
use regex::Regex;
use tracing::debug;
use crate::core::error::{Error, ErrorKind, Result};

static MATCH_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*match\s*\(\s*"(.*)"\s*\)\s*$"#).expect("static pattern"));
static REPLACE_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*replace\s*\(\s*"(.*)"\s*,\s*"(.*)"\s*\)\s*$"#).expect("static pattern"));
static SCRIPT_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*script\s*\((.*)\)\s*$"#).expect("static pattern"));

/// Post-processing applied to the DATA of every reported record.
///
/// The INDEX of a record is never changed.
#[derive(Debug, Clone)]
pub enum Transform {
    /// Keep only records matching the expression
    Match(regex::bytes::Regex),
    /// Replace every match, `$1` style groups are expanded
    Replace { re: regex::bytes::Regex, template: String },
    /// Pipe the record through an external command, a non-zero exit
    /// drops the record
    Script { argv: Vec<String>, work_dir: PathBuf },
}

impl Transform {
    /// Parse one `match("..")`, `replace("..", "..")` or
    /// `script(name, args..)` rule.
    ///
    /// Script names refer to `scripts`, which maps a name to the
    /// command and its leading arguments.
    pub fn parse(rule: &str, scripts: &BTreeMap<String, Vec<String>>) -> Result<Self> {
        if let Some(m) = MATCH_RULE.captures(rule) {
            let re = regex::bytes::Regex::new(&m[1])
                .map_err(|e| Error::option(format!("failed to compile match expression: {}", e)))?;
            return Ok(Transform::Match(re));
        }
        if let Some(m) = REPLACE_RULE.captures(rule) {
            let re = regex::bytes::Regex::new(&m[1])
                .map_err(|e| Error::option(format!("failed to compile replace expression: {}", e)))?;
            return Ok(Transform::Replace { re, template: m[2].to_string() });
        }
        if let Some(m) = SCRIPT_RULE.captures(rule) {
            let mut args = split_args(&m[1]).into_iter();
            let name = args
                .next()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| Error::option("no script name found"))?;
            let base = scripts
                .get(&name)
                .filter(|argv| !argv.is_empty())
                .ok_or_else(|| Error::option(format!("{:?} is unknown script transformation", name)))?;

            let argv: Vec<String> = base.iter().cloned().chain(args).collect();
            fs::metadata(&argv[0])
                .map_err(|e| Error::option(format!("no valid script found: {}: {}", argv[0], e)))?;
            return Ok(Transform::Script { argv, work_dir: std::env::temp_dir() });
        }
        Err(Error::option(format!("{:?} is unknown transformation", rule)))
    }

    /// `None` means the record is dropped
    pub fn process(&self, data: Vec<u8>) -> Result<Option<Vec<u8>>> {
        match self {
            Transform::Match(re) => Ok(re.is_match(&data).then_some(data)),
            Transform::Replace { re, template } => {
                Ok(Some(re.replace_all(&data, template.as_bytes()).into_owned()))
            }
            Transform::Script { argv, work_dir } => run_script(argv, work_dir, &data),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transform::Match(re) => write!(f, "match({:?})", re.as_str()),
            Transform::Replace { re, template } => write!(f, "replace({:?},{:?})", re.as_str(), template),
            Transform::Script { argv, .. } => write!(f, "script({:?})", argv),
        }
    }
}

/// Parse a whole chain, the first bad rule fails it
pub fn parse_chain(rules: &[String], scripts: &BTreeMap<String, Vec<String>>) -> Result<Vec<Transform>> {
    rules
        .iter()
        .map(|rule| Transform::parse(rule, scripts).map_err(|e| e.wrap("failed to parse transformation")))
        .collect()
}

/// Run `data` through every transform in order
pub fn apply(chain: &[Transform], data: Vec<u8>) -> Result<Option<Vec<u8>>> {
    let mut data = data;
    for tx in chain {
        match tx.process(data)? {
            Some(out) => data = out,
            None => return Ok(None),
        }
    }
    Ok(Some(data))
}

// comma separated, surrounding quotes are optional
fn split_args(s: &str) -> Vec<String> {
    s.split(',')
        .map(|a| {
            let a = a.trim();
            a.strip_prefix('"')
                .and_then(|a| a.strip_suffix('"'))
                .unwrap_or(a)
                .to_string()
        })
        .collect()
}

fn run_script(argv: &[String], work_dir: &Path, data: &[u8]) -> Result<Option<Vec<u8>>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| Error::option("no script path provided"))?;
    let mut child = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::new(ErrorKind::Io, format!("failed to start {}: {}", program, e)))?;

    // feed stdin while the output is collected
    let stdin = child.stdin.take();
    let output = thread::scope(|s| {
        s.spawn(move || {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(data) {
                    debug!("{}: stdin closed early: {}", program, e);
                }
            }
        });
        child.wait_with_output()
    })?;

    if !output.status.success() {
        debug!("{} exited with {}, record skipped", program, output.status);
        return Ok(None);
    }
    let mut out = output.stdout;
    out.extend_from_slice(&output.stderr);
    Ok(Some(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([
            ("upper".to_string(), vec!["/bin/sh".to_string(), "-c".to_string(), "tr a-z A-Z".to_string()]),
            ("reject".to_string(), vec!["/bin/sh".to_string(), "-c".to_string(), "exit 3".to_string()]),
            ("missing".to_string(), vec!["/no/such/script".to_string()]),
        ])
    }

    fn chain(rules: &[&str]) -> Result<Vec<Transform>> {
        let rules: Vec<String> = rules.iter().map(|r| r.to_string()).collect();
        parse_chain(&rules, &scripts())
    }

    #[test]
    fn test_parse() {
        let txs = chain(&[r#"match("^\d+")"#, r#" replace ( "(\d+)-" , "[$1]" ) "#, "script(upper)"]).unwrap();
        assert_eq!(txs.len(), 3);
        assert_eq!(txs[0].to_string(), r#"match("^\\d+")"#);
        assert_eq!(txs[1].to_string(), r#"replace("(\\d+)-","[$1]")"#);

        let err = chain(&["grep(x)"]).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Option);
        assert_eq!(err.context, r#"failed to parse transformation: "grep(x)" is unknown transformation"#);
        assert!(chain(&["script(nope)"]).unwrap_err().context.ends_with(r#""nope" is unknown script transformation"#));
        assert!(chain(&["script(missing)"]).unwrap_err().context.contains("no valid script found"));
        assert_eq!(chain(&[r#"match("(")"#]).unwrap_err().kind, ErrorKind::Option);
    }

    #[test]
    fn test_match_and_replace() {
        let txs = chain(&[r#"match("hello")"#, r#"replace("(\d+)-", "<$1>")"#]).unwrap();
        assert_eq!(apply(&txs, b"11-hello-11".to_vec()).unwrap(), Some(b"<11>hello-11".to_vec()));
        assert_eq!(apply(&txs, b"22-bye-22".to_vec()).unwrap(), None);
        assert_eq!(apply(&[], b"as is".to_vec()).unwrap(), Some(b"as is".to_vec()));
    }

    #[test]
    fn test_script() {
        let txs = chain(&["script(upper)"]).unwrap();
        assert_eq!(apply(&txs, b"hello".to_vec()).unwrap(), Some(b"HELLO".to_vec()));

        let txs = chain(&["script(\"upper\")", "script(reject)"]).unwrap();
        assert_eq!(apply(&txs, b"hello".to_vec()).unwrap(), None);
    }
}
