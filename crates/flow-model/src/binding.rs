//! Flow-to-target binding rules

use serde::{Deserialize, Serialize};
use url::Url;

/// What part of the target url a binding constrains.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    Domain,
    Path,
    Url,
}

/// A rule constraining which target state a flow may run against. A run with
/// no explicit start target must match at least one declared binding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Binding {
    #[serde(rename = "type")]
    pub kind: BindingKind,
    pub value: String,
}

impl Binding {
    pub fn domain(value: impl Into<String>) -> Self {
        Self {
            kind: BindingKind::Domain,
            value: value.into(),
        }
    }

    pub fn path(value: impl Into<String>) -> Self {
        Self {
            kind: BindingKind::Path,
            value: value.into(),
        }
    }

    pub fn url(value: impl Into<String>) -> Self {
        Self {
            kind: BindingKind::Url,
            value: value.into(),
        }
    }

    /// Whether the current target url satisfies this binding. Unparseable
    /// urls never match.
    pub fn matches(&self, current_url: &str) -> bool {
        match self.kind {
            BindingKind::Url => current_url.starts_with(&self.value),
            BindingKind::Domain => match Url::parse(current_url) {
                Ok(url) => url
                    .host_str()
                    .map(|host| host.contains(&self.value))
                    .unwrap_or(false),
                Err(_) => false,
            },
            BindingKind::Path => match Url::parse(current_url) {
                Ok(url) => url.path().starts_with(&self.value),
                Err(_) => false,
            },
        }
    }
}
