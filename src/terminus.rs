//! Source/Target descriptors attached to a link.

use fe2o3_amqp_types::definitions::Fields;
use serde_amqp::primitives::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminusKind {
    #[default]
    Unspecified,
    Source,
    Target,
}

/// How long a terminus outlives the link/session/connection that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpiryPolicy {
    LinkClose,
    #[default]
    SessionEnd,
    ConnectionClose,
    Never,
}

impl ExpiryPolicy {
    pub fn symbol(&self) -> &'static str {
        match self {
            ExpiryPolicy::LinkClose => "link-detach",
            ExpiryPolicy::SessionEnd => "session-end",
            ExpiryPolicy::ConnectionClose => "connection-close",
            ExpiryPolicy::Never => "never",
        }
    }

    pub fn from_symbol(sym: &str) -> Self {
        match sym {
            "link-detach" => ExpiryPolicy::LinkClose,
            "connection-close" => ExpiryPolicy::ConnectionClose,
            "never" => ExpiryPolicy::Never,
            _ => ExpiryPolicy::SessionEnd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionMode {
    #[default]
    Unspecified,
    Copy,
    Move,
}

impl DistributionMode {
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            DistributionMode::Unspecified => None,
            DistributionMode::Copy => Some("copy"),
            DistributionMode::Move => Some("move"),
        }
    }
}

/// The Source or Target descriptor carried by ATTACH.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Terminus {
    pub kind: TerminusKind,
    pub address: Option<String>,
    pub durable: u32,
    pub expiry_policy: ExpiryPolicy,
    pub timeout: u32,
    pub dynamic: bool,
    pub distribution_mode: DistributionMode,
    pub properties: Option<Fields>,
    pub capabilities: Vec<Symbol>,
    pub outcomes: Vec<Symbol>,
    pub filter: Option<Fields>,
}

impl Terminus {
    /// Field-wise copy of `src` into a fresh `Terminus`. Copying twice is
    /// equal to copying once: the result only ever depends on `src`.
    pub fn copy(src: &Terminus) -> Terminus {
        src.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_is_idempotent() {
        let src = Terminus {
            kind: TerminusKind::Source,
            address: Some("q1".to_string()),
            durable: 2,
            expiry_policy: ExpiryPolicy::ConnectionClose,
            timeout: 30,
            dynamic: true,
            distribution_mode: DistributionMode::Copy,
            properties: None,
            capabilities: vec![Symbol::from("cap")],
            outcomes: vec![Symbol::from("amqp:accepted:list")],
            filter: None,
        };

        let once = Terminus::copy(&src);
        let twice = Terminus::copy(&once);
        assert_eq!(once, twice);
        assert_eq!(once, src);
    }
}
