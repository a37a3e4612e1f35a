//! Small shared types used across the proxy core: the L/R side tag, the
//! sub-tags for accepted/delayed/permanent-connect slots, and the few size
//! constants the rest of the crate is built around.

use std::fmt;

/// Size a freshly created [`crate::hostcx::HostCx`] read buffer starts at.
pub const READBUF_INIT_SIZE: usize = 1024;
/// Hard ceiling a read buffer is allowed to grow to.
pub const READBUF_MAX_SIZE: usize = 1024 * READBUF_INIT_SIZE;
/// Peer write-buffer occupancy above which a CX stops being read (see
/// [`crate::proxy::BaseProxy`] bottleneck handling).
pub const BOTTLENECK_THRESHOLD: usize = 200_000;
/// Default reconnect window for permanent-connect CXes, and also the
/// opening-timeout grace period for any non-blocking connect/handshake.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 7;
/// Default idle timeout before a CX (and, transitively, its proxy) is
/// considered dead.
pub const DEFAULT_IDLE_DELAY_SECS: u64 = 3600;
/// Granularity of the poller's deferred rescan timer.
pub const DEFAULT_RESCAN_GRANULARITY_SECS: u64 = 1;
/// Maximum bytes pre-peeked from a client socket while looking for a
/// ClientHello.
pub const CLIENTHELLO_PEEK_SIZE: usize = 1500;

/// Which logical half of a proxy a [`crate::hostcx::HostCx`] belongs to.
///
/// Lower-case `l`/`r` distinguish accepted or delayed-accept CXes from the
/// capitalized `L`/`R` bound (listening) CXes; `x`/`y` mark the permanent-connect
/// slot on the left/right side respectively. This mirrors the single-character
/// side tags the core has always used in its logs and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideTag {
    /// Bound (listening) CX, left side.
    BoundLeft,
    /// Bound (listening) CX, right side.
    BoundRight,
    /// Accepted (or delayed-accept) CX, left side.
    AcceptedLeft,
    /// Accepted (or delayed-accept) CX, right side.
    AcceptedRight,
    /// Permanent-connect CX, left side.
    PermanentLeft,
    /// Permanent-connect CX, right side.
    PermanentRight,
}

impl SideTag {
    /// The logical side (L or R) this tag belongs to, irrespective of slot.
    pub fn side(self) -> Side {
        match self {
            SideTag::BoundLeft | SideTag::AcceptedLeft | SideTag::PermanentLeft => Side::Left,
            SideTag::BoundRight | SideTag::AcceptedRight | SideTag::PermanentRight => Side::Right,
        }
    }

    /// Single-character representation, matching the legacy `{L,R,l,r,x,y}` tags.
    pub fn as_char(self) -> char {
        match self {
            SideTag::BoundLeft => 'L',
            SideTag::BoundRight => 'R',
            SideTag::AcceptedLeft => 'l',
            SideTag::AcceptedRight => 'r',
            SideTag::PermanentLeft => 'x',
            SideTag::PermanentRight => 'y',
        }
    }
}

impl fmt::Display for SideTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// The two logical sides a [`crate::proxy::BaseProxy`] relates peers across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn from_char(c: char) -> Side {
        match c {
            'R' | 'r' | 'y' => Side::Right,
            _ => Side::Left,
        }
    }

    pub fn arrow(self) -> char {
        match self {
            Side::Right => '<',
            Side::Left => '>',
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "L"),
            Side::Right => write!(f, "R"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_tag_agrees_with_side() {
        assert_eq!(SideTag::AcceptedLeft.side(), Side::Left);
        assert_eq!(SideTag::PermanentRight.side(), Side::Right);
        assert_eq!(SideTag::BoundRight.as_char(), 'R');
    }

    #[test]
    fn side_opposite_is_involution() {
        assert_eq!(Side::Left.opposite().opposite(), Side::Left);
        assert_ne!(Side::Left.opposite(), Side::Left);
    }
}
