//! Endpoint identifiers
//!
//! An EID names a DTN endpoint in `<scheme>:<nss>` form, at most 79
//! bytes in total (scheme ≤ 15, NSS ≤ 63). Two schemes get first-class
//! treatment: the CBHE-conformant `ipn` scheme, whose NSS is
//! `<nodeNbr>.<serviceNbr>`, and the `dtn` scheme, within which
//! `dtn:none` is the null endpoint. Everything else is carried as an
//! opaque scheme/NSS pair.
//!
//! The CBHE node-number ceiling is an artifact of a legacy 24-bit
//! encoding; it is a parameter here, not a constant baked into parsing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::EidError;

/// Maximum scheme-name length in bytes
pub const MAX_SCHEME_NAME_LEN: usize = 15;
/// Maximum NSS length in bytes
pub const MAX_NSS_LEN: usize = 63;
/// Maximum total EID length (scheme + ':' + NSS)
pub const MAX_EID_LEN: usize = MAX_SCHEME_NAME_LEN + MAX_NSS_LEN + 1;

/// Scheme name of CBHE-conformant EIDs
pub const CBHE_SCHEME_NAME: &str = "ipn";
/// Scheme name of the null endpoint's scheme
pub const DTN_SCHEME_NAME: &str = "dtn";

/// Ceilings on CBHE node and service numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EidLimits {
    /// Largest admissible node number
    pub max_node_nbr: u64,
    /// Largest admissible service number
    pub max_service_nbr: u32,
}

impl Default for EidLimits {
    fn default() -> Self {
        Self {
            max_node_nbr: 16_777_215,
            max_service_nbr: 32_767,
        }
    }
}

/// A DTN endpoint identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Eid {
    /// The null endpoint, `dtn:none`
    #[default]
    Null,
    /// CBHE-conformant `ipn:<node>.<service>`
    Cbhe { node_nbr: u64, service_nbr: u32 },
    /// Any other scheme
    Dtn { scheme: String, nss: String },
}

impl Eid {
    /// Construct the `ipn` EID for a node and service number
    pub fn ipn(node_nbr: u64, service_nbr: u32) -> Self {
        Eid::Cbhe {
            node_nbr,
            service_nbr,
        }
    }

    /// Parse a textual EID under the default CBHE ceilings
    pub fn parse(text: &str) -> Result<Self, EidError> {
        Self::parse_with(text, &EidLimits::default())
    }

    /// Parse a textual EID under explicit CBHE ceilings
    pub fn parse_with(text: &str, limits: &EidLimits) -> Result<Self, EidError> {
        if text.len() > MAX_EID_LEN {
            return Err(EidError::TooLong {
                len: text.len(),
                max: MAX_EID_LEN,
            });
        }
        let (scheme, nss) = text
            .split_once(':')
            .ok_or_else(|| EidError::MissingDelimiter(text.to_string()))?;
        Self::from_parts_with(scheme, nss, limits)
    }

    /// Construct from already-separated scheme and NSS strings
    pub fn from_parts(scheme: &str, nss: &str) -> Result<Self, EidError> {
        Self::from_parts_with(scheme, nss, &EidLimits::default())
    }

    /// Construct from scheme and NSS under explicit ceilings
    pub fn from_parts_with(scheme: &str, nss: &str, limits: &EidLimits) -> Result<Self, EidError> {
        if scheme.is_empty() {
            return Err(EidError::EmptyScheme);
        }
        if scheme.len() > MAX_SCHEME_NAME_LEN {
            return Err(EidError::SchemeTooLong {
                max: MAX_SCHEME_NAME_LEN,
            });
        }
        if nss.is_empty() {
            return Err(EidError::EmptyNss);
        }
        if nss.len() > MAX_NSS_LEN {
            return Err(EidError::NssTooLong { max: MAX_NSS_LEN });
        }
        if scheme == DTN_SCHEME_NAME && nss == "none" {
            return Ok(Eid::Null);
        }
        if scheme == CBHE_SCHEME_NAME {
            let (node, service) = nss
                .split_once('.')
                .ok_or_else(|| EidError::MalformedIpnNss(nss.to_string()))?;
            let node_nbr: u64 = node
                .parse()
                .map_err(|_| EidError::MalformedIpnNss(nss.to_string()))?;
            let service_nbr: u32 = service
                .parse()
                .map_err(|_| EidError::MalformedIpnNss(nss.to_string()))?;
            if node_nbr > limits.max_node_nbr {
                return Err(EidError::NodeNumberTooLarge {
                    nbr: node_nbr,
                    max: limits.max_node_nbr,
                });
            }
            if service_nbr > limits.max_service_nbr {
                return Err(EidError::ServiceNumberTooLarge {
                    nbr: service_nbr,
                    max: limits.max_service_nbr,
                });
            }
            return Ok(Eid::Cbhe {
                node_nbr,
                service_nbr,
            });
        }
        Ok(Eid::Dtn {
            scheme: scheme.to_string(),
            nss: nss.to_string(),
        })
    }

    /// Scheme name of this EID
    pub fn scheme_name(&self) -> &str {
        match self {
            Eid::Null => DTN_SCHEME_NAME,
            Eid::Cbhe { .. } => CBHE_SCHEME_NAME,
            Eid::Dtn { scheme, .. } => scheme,
        }
    }

    /// NSS of this EID in textual form
    pub fn nss(&self) -> String {
        match self {
            Eid::Null => "none".to_string(),
            Eid::Cbhe {
                node_nbr,
                service_nbr,
            } => format!("{node_nbr}.{service_nbr}"),
            Eid::Dtn { nss, .. } => nss.clone(),
        }
    }

    /// Whether this is the null endpoint
    pub fn is_null(&self) -> bool {
        matches!(self, Eid::Null)
    }

    /// Whether this EID is CBHE-conformant
    pub fn is_cbhe(&self) -> bool {
        matches!(self, Eid::Cbhe { .. })
    }

    /// CBHE node number, if any
    pub fn node_nbr(&self) -> Option<u64> {
        match self {
            Eid::Cbhe { node_nbr, .. } => Some(*node_nbr),
            _ => None,
        }
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme_name(), self.nss())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipn() {
        let eid = Eid::parse("ipn:12.34").unwrap();
        assert_eq!(
            eid,
            Eid::Cbhe {
                node_nbr: 12,
                service_nbr: 34
            }
        );
        assert_eq!(eid.to_string(), "ipn:12.34");
        assert!(eid.is_cbhe());
    }

    #[test]
    fn test_parse_null() {
        let eid = Eid::parse("dtn:none").unwrap();
        assert!(eid.is_null());
        assert_eq!(eid.to_string(), "dtn:none");
    }

    #[test]
    fn test_parse_opaque_scheme() {
        let eid = Eid::parse("mars:rover/7").unwrap();
        assert_eq!(eid.scheme_name(), "mars");
        assert_eq!(eid.nss(), "rover/7");
    }

    #[test]
    fn test_node_number_ceiling() {
        assert!(matches!(
            Eid::parse("ipn:16777216.1"),
            Err(EidError::NodeNumberTooLarge { .. })
        ));
        // Raising the ceiling admits the same EID.
        let limits = EidLimits {
            max_node_nbr: u64::MAX,
            max_service_nbr: 32_767,
        };
        assert!(Eid::parse_with("ipn:16777216.1", &limits).is_ok());
    }

    #[test]
    fn test_service_number_ceiling() {
        assert!(matches!(
            Eid::parse("ipn:1.32768"),
            Err(EidError::ServiceNumberTooLarge { .. })
        ));
    }

    #[test]
    fn test_length_limits() {
        let long_nss = "a".repeat(64);
        assert!(matches!(
            Eid::parse(&format!("x:{long_nss}")),
            Err(EidError::NssTooLong { .. })
        ));
        let long_scheme = "s".repeat(16);
        assert!(matches!(
            Eid::parse(&format!("{long_scheme}:n")),
            Err(EidError::SchemeTooLong { .. })
        ));
    }

    #[test]
    fn test_missing_delimiter() {
        assert!(matches!(
            Eid::parse("no-colon-here"),
            Err(EidError::MissingDelimiter(_))
        ));
    }
}
