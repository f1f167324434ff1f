use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared::types::{Address, ProgramKind};

const DEFAULT_INCOMPATIBLE_PHRASES: &[&str] = &[
    "incompatible privatekeys",
    "incompatible private keys",
    "not all private keys are correct",
];

const DEFAULT_NO_BLOCK_PHRASES: &[&str] =
    &["no target block found", "provide blockid or have an active block"];

/// Raw settings file shape. Loose on purpose: operators hand-edit this
/// file and the legacy keys still show up in the wild.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub user_token: String,
    #[serde(default)]
    pub telegram_accesstoken: String,
    #[serde(default)]
    pub telegram_chatid: Option<StringOrNumber>,
    #[serde(default)]
    pub worker_name: Option<String>,
    #[serde(default)]
    pub workername: Option<String>,
    #[serde(default)]
    pub additional_addresses: Vec<String>,
    #[serde(default)]
    pub additional_address: Option<String>,
    #[serde(default)]
    pub block_length: Option<StringOrNumber>,
    #[serde(default)]
    pub program_path: String,
    #[serde(default)]
    pub program_arguments: String,
    #[serde(default)]
    pub program_name: String,
    #[serde(default)]
    pub oneshot: bool,
    #[serde(default)]
    pub send_additional_keys_to_api: bool,
    #[serde(default = "default_true")]
    pub post_block_delay_enabled: bool,
    #[serde(default)]
    pub post_block_delay_minutes: Option<f64>,
    #[serde(default)]
    pub incompatible_phrases: Option<Vec<String>>,
    #[serde(default)]
    pub no_block_phrases: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum StringOrNumber {
    Text(String),
    Number(i64),
}

impl StringOrNumber {
    fn into_string(self) -> String {
        match self {
            StringOrNumber::Text(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        }
    }
}

/// Response-text matcher for pool rejection phrasing. The phrases are
/// configurable because the pool wording is not a stable contract; an
/// unmatched rejection falls through to the generic retryable path.
#[derive(Debug, Clone)]
pub struct RejectionMatcher {
    incompatible: Vec<String>,
    no_block: Vec<String>,
}

impl RejectionMatcher {
    fn new(incompatible: Option<Vec<String>>, no_block: Option<Vec<String>>) -> RejectionMatcher {
        let defaults = |d: &[&str]| d.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        RejectionMatcher {
            incompatible: incompatible
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| defaults(DEFAULT_INCOMPATIBLE_PHRASES)),
            no_block: no_block
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| defaults(DEFAULT_NO_BLOCK_PHRASES)),
        }
    }

    pub fn is_incompatible(&self, text: &str) -> bool {
        let t = text.to_lowercase();
        self.incompatible.iter().any(|p| t.contains(p.as_str()))
    }

    pub fn is_no_block(&self, text: &str) -> bool {
        let t = text.to_lowercase();
        self.no_block.iter().any(|p| t.contains(p.as_str()))
    }
}

/// Validated configuration snapshot. Reloaded wholesale at loop
/// checkpoints and swapped in one piece.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub pool_token: String,
    pub telegram_token: String,
    pub telegram_chat_id: String,
    pub worker_name: String,
    pub target_addresses: Vec<Address>,
    pub block_length: Option<String>,
    pub program_path: PathBuf,
    pub program_args: Vec<String>,
    pub kind: ProgramKind,
    pub one_shot: bool,
    pub send_found_keys_to_api: bool,
    pub post_block_delay: Duration,
    pub matcher: RejectionMatcher,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("settings file {} not found: {e}", path.display()))?;
        let settings: Settings = serde_json::from_reader(file)
            .map_err(|e| anyhow::anyhow!("invalid settings file {}: {e}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Ok(Config::from_settings(settings, base))
    }

    fn from_settings(s: Settings, base: &Path) -> Config {
        let api_url = s.api_url.trim().trim_matches('`').to_string();

        let mut targets: Vec<Address> = s
            .additional_addresses
            .iter()
            .filter(|a| !a.trim().is_empty())
            .map(|a| Address(a.clone()))
            .collect();
        if let Some(legacy) = s.additional_address {
            let legacy = Address(legacy);
            if !legacy.as_str().trim().is_empty() && !targets.contains(&legacy) {
                targets.push(legacy);
            }
        }

        let post_block_delay = if s.post_block_delay_enabled {
            match s.post_block_delay_minutes {
                Some(m) => Duration::from_secs((m.max(0.0) * 60.0) as u64),
                None => Duration::from_secs(10),
            }
        } else {
            Duration::ZERO
        };

        Config {
            api_url,
            pool_token: s.user_token,
            telegram_token: s.telegram_accesstoken,
            telegram_chat_id: s.telegram_chatid.map(StringOrNumber::into_string).unwrap_or_default(),
            worker_name: s.worker_name.or(s.workername).unwrap_or_default(),
            target_addresses: targets,
            block_length: s
                .block_length
                .map(StringOrNumber::into_string)
                .filter(|l| !l.trim().is_empty()),
            program_path: resolve_program_path(&s.program_path, base),
            program_args: s.program_arguments.split_whitespace().map(str::to_string).collect(),
            kind: ProgramKind::from_name(&s.program_name),
            one_shot: s.oneshot,
            send_found_keys_to_api: s.send_additional_keys_to_api,
            post_block_delay,
            matcher: RejectionMatcher::new(s.incompatible_phrases, s.no_block_phrases),
        }
    }
}

/// The path setting may carry several `|`-separated candidates (one per
/// platform); pick the first that exists, resolving relative candidates
/// against the settings file's directory.
fn resolve_program_path(raw: &str, base: &Path) -> PathBuf {
    let candidates: Vec<&str> = raw.split('|').map(str::trim).filter(|p| !p.is_empty()).collect();
    for cand in &candidates {
        let p = PathBuf::from(cand);
        let resolved = if p.is_absolute() { p } else { base.join(cand) };
        if resolved.exists() {
            return resolved;
        }
    }
    let first = candidates.first().copied().unwrap_or(raw);
    let p = PathBuf::from(first);
    if p.is_absolute() {
        p
    } else {
        base.join(first)
    }
}

/// Working-directory layout: every I/O file the worker owns lives here.
#[derive(Debug, Clone)]
pub struct WorkDir {
    dir: PathBuf,
}

impl WorkDir {
    pub fn new(dir: PathBuf) -> WorkDir {
        WorkDir {
            dir,
        }
    }

    pub fn in_file(&self) -> PathBuf {
        self.dir.join("in.txt")
    }

    pub fn out_file(&self) -> PathBuf {
        self.dir.join("out.txt")
    }

    pub fn device_out_file(&self, idx: usize) -> PathBuf {
        self.dir.join(format!("out_gpu_{idx}.txt"))
    }

    pub fn keyfound_file(&self) -> PathBuf {
        self.dir.join("KEYFOUND.txt")
    }

    pub fn pending_keys_file(&self) -> PathBuf {
        self.dir.join("pending_keys.json")
    }

    pub fn telegram_state_file(&self) -> PathBuf {
        self.dir.join("telegram_state.json")
    }

    /// Every `out_gpu_<n>.txt` currently on disk, in device order.
    pub fn device_out_files(&self) -> Vec<PathBuf> {
        let mut found = vec![];
        for idx in 0..64 {
            let p = self.device_out_file(idx);
            if p.exists() {
                found.push(p);
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        let settings: Settings = serde_json::from_str(json).unwrap();
        Config::from_settings(settings, Path::new("/tmp"))
    }

    #[test]
    fn minimal_settings() {
        let cfg = parse(r#"{"api_url": " `http://pool/api` ", "user_token": "t"}"#);
        assert_eq!(cfg.api_url, "http://pool/api");
        assert_eq!(cfg.pool_token, "t");
        assert!(cfg.target_addresses.is_empty());
        assert_eq!(cfg.post_block_delay, Duration::from_secs(10));
        assert!(!cfg.one_shot);
    }

    #[test]
    fn legacy_address_merged_once() {
        let cfg = parse(
            r#"{"additional_addresses": ["1A", "", "1B"], "additional_address": "1A"}"#,
        );
        let names: Vec<&str> = cfg.target_addresses.iter().map(|a| a.as_str()).collect();
        assert_eq!(names, vec!["1A", "1B"]);
    }

    #[test]
    fn delay_disabled_and_negative() {
        let cfg = parse(r#"{"post_block_delay_enabled": false}"#);
        assert_eq!(cfg.post_block_delay, Duration::ZERO);
        let cfg = parse(r#"{"post_block_delay_minutes": -5.0}"#);
        assert_eq!(cfg.post_block_delay, Duration::ZERO);
        let cfg = parse(r#"{"post_block_delay_minutes": 0.5}"#);
        assert_eq!(cfg.post_block_delay, Duration::from_secs(30));
    }

    #[test]
    fn chat_id_accepts_number() {
        let cfg = parse(r#"{"telegram_chatid": -100123}"#);
        assert_eq!(cfg.telegram_chat_id, "-100123");
    }

    #[test]
    fn matcher_defaults() {
        let cfg = parse("{}");
        assert!(cfg.matcher.is_incompatible("Error: Incompatible PrivateKeys supplied"));
        assert!(cfg.matcher.is_no_block("NO TARGET BLOCK FOUND for worker"));
        assert!(!cfg.matcher.is_incompatible("quota exceeded"));
    }

    #[test]
    fn matcher_overrides() {
        let cfg = parse(r#"{"incompatible_phrases": ["keys rejected"]}"#);
        assert!(cfg.matcher.is_incompatible("KEYS REJECTED by pool"));
        assert!(!cfg.matcher.is_incompatible("incompatible privatekeys"));
    }
}
