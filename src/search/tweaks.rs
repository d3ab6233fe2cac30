use std::collections::BTreeMap;
use serde::{Deserialize, Deserializer, Serialize};
use crate::core::error::{Error, Result};
use crate::query::options::Mode;

pub const RYFTPRIM: &str = "ryftprim";
pub const RYFTX: &str = "ryftx";
pub const RYFTPCRE2: &str = "ryftpcre2";

/// Backend options injection and routing table.
///
/// `options` keys are `<backend-mode>.<tool>.<primitive>` or any
/// shorter combination, `default` matches everything. `router` keys
/// may list several primitives separated by spaces or `,;:`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tweaks {
    pub options: BTreeMap<String, Vec<String>>,
    #[serde(deserialize_with = "router_table")]
    pub router: BTreeMap<String, String>,       // primitive -> tool
    pub exec: BTreeMap<String, Vec<String>>,    // tool -> argv prefix
}

fn router_table<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<BTreeMap<String, String>, D::Error> {
    let raw = BTreeMap::<String, String>::deserialize(d)?;
    let mut table = BTreeMap::new();
    for (keys, tool) in raw {
        let sep = |c: char| c.is_whitespace() || ",;:".contains(c);
        for key in keys.split(sep).filter(|k| !k.is_empty()) {
            table.insert(key.to_string(), tool.clone());
        }
    }
    Ok(table)
}

impl Tweaks {
    /// Extra backend arguments, most specific key first
    pub fn get_options(&self, mode: &str, backend: &str, primitive: &str) -> Option<&[String]> {
        let ladder: [&[&str]; 7] = [
            &[mode, backend, primitive],
            &[mode, primitive],
            &[mode, backend],
            &[mode],
            &[backend, primitive],
            &[primitive],
            &[backend],
        ];

        for parts in ladder {
            let key = parts.join(".");
            let key = key.trim_matches('.');
            let key = if key.is_empty() { "default" } else { key };
            if let Some(opts) = self.options.get(key) {
                return Some(opts);
            }
        }
        None
    }

    pub fn set_options(&mut self, mode: &str, backend: &str, primitive: &str, opts: Option<Vec<String>>) {
        let key = [mode, backend, primitive]
            .iter()
            .filter(|s| !s.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join(".");

        match opts {
            Some(opts) => {
                self.options.insert(key, opts);
            }
            None => {
                self.options.remove(&key);
            }
        }
    }

    pub fn route(&self, primitive: &str) -> Option<&str> {
        self.router
            .get(primitive)
            .or_else(|| self.router.get("default"))
            .map(String::as_str)
    }

    /// Command line used to start `tool`
    pub fn exec_argv(&self, tool: &str) -> Vec<String> {
        match self.exec.get(tool) {
            Some(argv) if !argv.is_empty() => argv.clone(),
            _ => vec![tool.to_string()],
        }
    }

    /// Pick the backend tool: explicit request, then router, then by primitive
    pub fn select_tool(&self, requested: &str, mode: Mode, dist: u32) -> Result<String> {
        match requested.to_ascii_lowercase().as_str() {
            "ryftprim" | "prim" | "1" => return Ok(RYFTPRIM.to_string()),
            "ryftx" | "x" => return Ok(RYFTX.to_string()),
            "ryftpcre2" | "pcre2" | "regexp" | "regex" | "re" => return Ok(RYFTPCRE2.to_string()),
            "" => {}
            other => return Err(Error::option(format!("{:?} is unknown backend tool", other))),
        }

        if let Some(tool) = self.route(mode.as_str()) {
            return Ok(tool.to_string());
        }

        let tool = match mode {
            Mode::Es | Mode::Ds | Mode::Ts | Mode::Ns | Mode::Cs | Mode::Ipv4 | Mode::Ipv6 => RYFTX,
            Mode::Fhs if dist <= 1 => RYFTX,
            Mode::Fhs | Mode::Feds => RYFTPRIM,
            Mode::Pcre2 => RYFTPCRE2,
        };
        Ok(tool.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tweaks() -> Tweaks {
        serde_json::from_str(
            r#"{
                "options": {
                    "default": ["-a"],
                    "high.ryftprim.fhs": ["-b"],
                    "high.fhs": ["-c"],
                    "ryftx": ["-d"],
                    "ryftprim.es": ["-e", "1"]
                },
                "router": {
                    "es, ds;ts": "ryftprim",
                    "default": "ryftx"
                },
                "exec": {
                    "ryftx": ["/opt/ryft/bin/ryftx", "--quiet"]
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_options_ladder() {
        let t = tweaks();
        assert_eq!(t.get_options("high", "ryftprim", "fhs").unwrap(), ["-b"]);
        assert_eq!(t.get_options("high", "ryftx", "fhs").unwrap(), ["-c"]);
        assert_eq!(t.get_options("", "ryftx", "feds").unwrap(), ["-d"]);
        assert_eq!(t.get_options("", "ryftprim", "es").unwrap(), ["-e", "1"]);
        assert_eq!(t.get_options("", "ryftprim", "feds").unwrap(), ["-a"]);
        assert!(Tweaks::default().get_options("", "ryftprim", "es").is_none());
    }

    #[test]
    fn test_set_options() {
        let mut t = Tweaks::default();
        t.set_options("", "ryftprim", "", Some(vec!["-x".to_string()]));
        assert_eq!(t.get_options("low", "ryftprim", "es").unwrap(), ["-x"]);
        t.set_options("", "ryftprim", "", None);
        assert!(t.options.is_empty());
    }

    #[test]
    fn test_router_and_exec() {
        let t = tweaks();
        assert_eq!(t.route("es"), Some("ryftprim"));
        assert_eq!(t.route("ts"), Some("ryftprim"));
        assert_eq!(t.route("pcre2"), Some("ryftx"));
        assert_eq!(t.exec_argv("ryftx"), ["/opt/ryft/bin/ryftx", "--quiet"]);
        assert_eq!(t.exec_argv("ryftprim"), ["ryftprim"]);
    }

    #[test]
    fn test_select_tool() {
        let t = Tweaks::default();
        assert_eq!(t.select_tool("", Mode::Es, 0).unwrap(), RYFTX);
        assert_eq!(t.select_tool("", Mode::Fhs, 1).unwrap(), RYFTX);
        assert_eq!(t.select_tool("", Mode::Fhs, 2).unwrap(), RYFTPRIM);
        assert_eq!(t.select_tool("", Mode::Feds, 1).unwrap(), RYFTPRIM);
        assert_eq!(t.select_tool("", Mode::Pcre2, 0).unwrap(), RYFTPCRE2);
        assert_eq!(t.select_tool("prim", Mode::Es, 0).unwrap(), RYFTPRIM);
        assert!(t.select_tool("grep", Mode::Es, 0).is_err());

        assert_eq!(tweaks().select_tool("", Mode::Es, 0).unwrap(), RYFTPRIM);
        assert_eq!(tweaks().select_tool("", Mode::Feds, 3).unwrap(), RYFTX);
    }
}
