//! Identifiers for TCP flow directions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Identifier for a one-way TCP flow.
///
/// The reverse direction is a distinct key; use [`BidiKey`] when both
/// directions should collapse into one (reporting only, never masking).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct FlowKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            src,
            dst,
            src_port,
            dst_port,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// Identifier for a two-way TCP flow, built by sorting the endpoints.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct BidiKey(FlowKey);

impl From<FlowKey> for BidiKey {
    fn from(other: FlowKey) -> Self {
        let p0 = (other.src, other.src_port);
        let p1 = (other.dst, other.dst_port);
        let ((src, src_port), (dst, dst_port)) = if p0 <= p1 { (p0, p1) } else { (p1, p0) };
        Self(FlowKey {
            src,
            dst,
            src_port,
            dst_port,
        })
    }
}

impl fmt::Display for BidiKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.0.src, self.0.src_port, self.0.dst, self.0.dst_port
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(a: &str, ap: u16, b: &str, bp: u16) -> FlowKey {
        FlowKey::new(a.parse().unwrap(), ap, b.parse().unwrap(), bp)
    }

    #[test]
    fn test_reversed_is_distinct() {
        let fwd = key("10.0.0.1", 443, "10.0.0.2", 50000);
        let rev = fwd.reversed();
        assert_ne!(fwd, rev);
        assert_eq!(rev.reversed(), fwd);
    }

    #[test]
    fn test_bidi_collapses_directions() {
        let fwd = key("10.0.0.1", 443, "10.0.0.2", 50000);
        assert_eq!(BidiKey::from(fwd), BidiKey::from(fwd.reversed()));
    }

    #[test]
    fn test_bidi_mixed_families() {
        let v4v6 = key("10.0.0.1", 443, "::1", 50000);
        assert_eq!(BidiKey::from(v4v6), BidiKey::from(v4v6.reversed()));
    }
}
