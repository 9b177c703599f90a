use std::{fs, path::PathBuf, sync::RwLock};

use anyhow::{anyhow, Context};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Credential bundle for the WeChat MP platform, persisted as a JSON file
/// and refreshed through the session endpoint by an external login tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WechatSession {
    pub token: Option<String>,
    pub cookies: Option<Value>,
    pub cookies_str: Option<String>,
    pub user_agent: Option<String>,
    pub expiry: Option<Value>,
    pub expiry_human: Option<String>,
    pub saved_at: Option<String>,
}

impl WechatSession {
    /// Usable once both the token and the cookie string are present.
    pub fn is_valid(&self) -> bool {
        let filled = |field: &Option<String>| {
            field.as_deref().is_some_and(|value| !value.trim().is_empty())
        };
        filled(&self.token) && filled(&self.cookies_str)
    }
}

/// Partial session payload; only fields present in the request overwrite
/// the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionUpdate {
    pub token: Option<String>,
    pub cookies: Option<Value>,
    pub cookies_str: Option<String>,
    pub user_agent: Option<String>,
    pub expiry: Option<Value>,
    pub expiry_human: Option<String>,
}

impl SessionUpdate {
    pub fn is_empty(&self) -> bool {
        self.token.is_none()
            && self.cookies.is_none()
            && self.cookies_str.is_none()
            && self.user_agent.is_none()
            && self.expiry.is_none()
            && self.expiry_human.is_none()
    }
}

pub struct SessionStore {
    path: PathBuf,
    inner: RwLock<WechatSession>,
}

impl SessionStore {
    /// Load the stored session; a missing file just means no session yet.
    pub fn load(path: PathBuf) -> Self {
        let session = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(session) => session,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "malformed session file, starting empty");
                    WechatSession::default()
                }
            },
            Err(_) => WechatSession::default(),
        };
        Self {
            path,
            inner: RwLock::new(session),
        }
    }

    pub fn current(&self) -> WechatSession {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn is_valid(&self) -> bool {
        self.inner
            .read()
            .map(|guard| guard.is_valid())
            .unwrap_or(false)
    }

    /// Merge the update's present fields into the stored session, refresh
    /// `saved_at`, write the file and return the merged view.
    pub fn apply(&self, update: SessionUpdate) -> anyhow::Result<WechatSession> {
        let merged = {
            let mut guard = self
                .inner
                .write()
                .map_err(|_| anyhow!("failed to acquire session lock"))?;
            if let Some(token) = update.token {
                guard.token = Some(token);
            }
            if let Some(cookies) = update.cookies {
                guard.cookies = Some(cookies);
            }
            if let Some(cookies_str) = update.cookies_str {
                guard.cookies_str = Some(cookies_str);
            }
            if let Some(user_agent) = update.user_agent {
                guard.user_agent = Some(user_agent);
            }
            if let Some(expiry) = update.expiry {
                guard.expiry = Some(expiry);
            }
            if let Some(expiry_human) = update.expiry_human {
                guard.expiry_human = Some(expiry_human);
            }
            guard.saved_at = Some(Utc::now().format("%Y-%m-%d %H:%M:%S").to_string());
            guard.clone()
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create session dir {}", parent.display()))?;
            }
        }
        let serialized =
            serde_json::to_string_pretty(&merged).context("serialize wechat session")?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("write session file {}", self.path.display()))?;
        Ok(merged)
    }
}
