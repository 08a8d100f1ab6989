//! Canonical addresses for configuration and state objects.
//!
//! An instance address looks like
//! `module.net.module.sub.aws_instance.web[2]` or
//! `module.net.data.aws_ami.base["amd64"]`. Addresses are lexically
//! comparable and parseable; external callers treat them as opaque.

use serde::{Deserialize, Serialize};

/// Managed resource or data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    Managed,
    Data,
}

/// A path of module call names from the root. Empty path is the root module.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ModulePath(pub Vec<String>);

impl ModulePath {
    pub fn root() -> ModulePath {
        ModulePath(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, name: impl Into<String>) -> ModulePath {
        let mut path = self.0.clone();
        path.push(name.into());
        ModulePath(path)
    }

    pub fn parent(&self) -> Option<(ModulePath, &str)> {
        let name = self.0.last()?;
        Some((ModulePath(self.0[..self.0.len() - 1].to_vec()), name))
    }
}

impl std::fmt::Display for ModulePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "module.{}", name)?;
        }
        Ok(())
    }
}

/// A resource block address before instance expansion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceAddr {
    pub module: ModulePath,
    pub mode: ResourceMode,
    pub r#type: String,
    pub name: String,
}

impl ResourceAddr {
    pub fn managed(module: ModulePath, r#type: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceAddr {
            module,
            mode: ResourceMode::Managed,
            r#type: r#type.into(),
            name: name.into(),
        }
    }

    pub fn data(module: ModulePath, r#type: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceAddr {
            module,
            mode: ResourceMode::Data,
            r#type: r#type.into(),
            name: name.into(),
        }
    }

    pub fn instance(&self, key: InstanceKey) -> InstanceAddr {
        InstanceAddr {
            resource: self.clone(),
            key,
        }
    }
}

impl std::fmt::Display for ResourceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.module.is_root() {
            write!(f, "{}.", self.module)?;
        }
        if self.mode == ResourceMode::Data {
            write!(f, "data.")?;
        }
        write!(f, "{}.{}", self.r#type, self.name)
    }
}

/// Instance key from `count` (index) or `for_each` (string key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceKey {
    None,
    Index(usize),
    Key(String),
}

impl InstanceKey {
    pub fn is_none(&self) -> bool {
        matches!(self, InstanceKey::None)
    }
}

impl PartialOrd for InstanceKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for InstanceKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (InstanceKey::None, InstanceKey::None) => Ordering::Equal,
            (InstanceKey::None, _) => Ordering::Less,
            (_, InstanceKey::None) => Ordering::Greater,
            (InstanceKey::Index(a), InstanceKey::Index(b)) => a.cmp(b),
            (InstanceKey::Index(_), InstanceKey::Key(_)) => Ordering::Less,
            (InstanceKey::Key(_), InstanceKey::Index(_)) => Ordering::Greater,
            (InstanceKey::Key(a), InstanceKey::Key(b)) => a.cmp(b),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceKey::None => Ok(()),
            InstanceKey::Index(i) => write!(f, "[{}]", i),
            InstanceKey::Key(k) => write!(f, "[{:?}]", k),
        }
    }
}

/// A fully expanded resource instance address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceAddr {
    pub resource: ResourceAddr,
    pub key: InstanceKey,
}

impl std::fmt::Display for InstanceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.resource, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrParseError;

impl std::fmt::Display for AddrParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid resource address")
    }
}
impl std::error::Error for AddrParseError {}

impl std::str::FromStr for InstanceAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split off an instance key suffix if present.
        let (base, key) = match s.rfind('[') {
            Some(open) if s.ends_with(']') => {
                let raw = &s[open + 1..s.len() - 1];
                let key = if let Some(stripped) =
                    raw.strip_prefix('"').and_then(|r| r.strip_suffix('"'))
                {
                    InstanceKey::Key(stripped.to_string())
                } else {
                    InstanceKey::Index(raw.parse().map_err(|_| AddrParseError)?)
                };
                (&s[..open], key)
            }
            _ => (s, InstanceKey::None),
        };

        let mut parts: Vec<&str> = base.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(AddrParseError);
        }

        let mut module = ModulePath::root();
        while parts.len() > 2 && parts[0] == "module" {
            module = module.child(parts[1]);
            parts.drain(..2);
        }

        let mode = if parts.first() == Some(&"data") {
            parts.remove(0);
            ResourceMode::Data
        } else {
            ResourceMode::Managed
        };

        if parts.len() != 2 {
            return Err(AddrParseError);
        }

        Ok(InstanceAddr {
            resource: ResourceAddr {
                module,
                mode,
                r#type: parts[0].to_string(),
                name: parts[1].to_string(),
            },
            key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        for s in [
            "null.a",
            "data.aws_ami.base",
            "module.net.aws_instance.web[2]",
            "module.net.module.sub.aws_instance.web[\"a\"]",
        ] {
            let addr: InstanceAddr = s.parse().unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!("".parse::<InstanceAddr>().is_err());
        assert!("onlyone".parse::<InstanceAddr>().is_err());
        assert!("a..b".parse::<InstanceAddr>().is_err());
        assert!("x.y[zz]".parse::<InstanceAddr>().is_err());
    }

    #[test]
    fn ordering_is_stable() {
        let mut addrs: Vec<InstanceAddr> = [
            "null.b",
            "null.a[1]",
            "null.a[0]",
            "data.null.a",
            "null.a[\"x\"]",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();
        addrs.sort();
        let rendered: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "data.null.a",
                "null.a[0]",
                "null.a[1]",
                "null.a[\"x\"]",
                "null.b",
            ]
        );
    }

    #[test]
    fn module_path_display() {
        let p = ModulePath::root().child("net").child("sub");
        assert_eq!(p.to_string(), "module.net.module.sub");
        let (parent, name) = p.parent().unwrap();
        assert_eq!(name, "sub");
        assert_eq!(parent.to_string(), "module.net");
    }
}
