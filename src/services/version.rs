//! Checks whether a newer release has been published.

use serde::Deserialize;

use crate::client::TransportError;
use crate::utils::is_newer_version;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    #[serde(default)]
    pub url: Option<String>,
}

pub fn fetch_build_info(agent: &ureq::Agent, url: &str) -> Result<BuildInfo, TransportError> {
    let res = agent.get(url).set("Accept", "application/json").call()?;
    serde_json::from_reader(res.into_reader()).map_err(|e| TransportError::Malformed(e.to_string()))
}

/// `remote` if it is newer than `current`.
pub fn newer_than(remote: BuildInfo, current: &str) -> Option<BuildInfo> {
    is_newer_version(&remote.version, current).then_some(remote)
}

/// Fetches the published build info and compares it with this build.
pub fn check_version(agent: &ureq::Agent, url: &str) -> Result<Option<BuildInfo>, TransportError> {
    let remote = fetch_build_info(agent, url)?;
    Ok(newer_than(remote, env!("CARGO_PKG_VERSION")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_info() {
        let info: BuildInfo = serde_json::from_str(r#"{ "version": "1.4.0", "url": "https://example.org/dl" }"#)
            .expect("valid build info");
        assert_eq!(info.version, "1.4.0");
        assert_eq!(info.url.as_deref(), Some("https://example.org/dl"));

        let bare: BuildInfo = serde_json::from_str(r#"{ "version": "0.1.0" }"#).expect("valid build info");
        assert_eq!(bare.url, None);
    }

    #[test]
    fn only_newer_versions_are_reported() {
        let remote = BuildInfo {
            version: "0.2.0".into(),
            url: None,
        };
        assert_eq!(newer_than(remote.clone(), "0.1.9"), Some(remote.clone()));
        assert_eq!(newer_than(remote, "0.2.0"), None);
    }
}
