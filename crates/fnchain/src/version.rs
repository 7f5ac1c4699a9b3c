//! Version information reported on `/health`.

/// fnchain version from Cargo.toml
pub const FNCHAIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Gateway,
    Runner,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub fnchain: &'static str,
    pub role: Role,
}

impl VersionInfo {
    pub fn new(role: Role) -> Self {
        Self {
            fnchain: FNCHAIN_VERSION,
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_carries_crate_version() {
        let info = VersionInfo::new(Role::Runner);
        assert_eq!(info.fnchain, FNCHAIN_VERSION);
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo {
            fnchain: "0.1.0",
            role: Role::Gateway,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "fnchain": "0.1.0",
          "role": "gateway"
        }
        "#);
    }
}
