pub mod stream;

pub use stream::{FeedClient, FeedHandle};

use std::fmt;

/// The failover state machine: providers alternate on every connection
/// failure, with no blacklisting within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Primary,
    Secondary,
}

impl Provider {
    pub fn switch(self) -> Provider {
        match self {
            Provider::Primary => Provider::Secondary,
            Provider::Secondary => Provider::Primary,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Primary => write!(f, "primary"),
            Provider::Secondary => write!(f, "secondary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_alternate() {
        assert_eq!(Provider::Primary.switch(), Provider::Secondary);
        assert_eq!(Provider::Secondary.switch(), Provider::Primary);
        assert_eq!(Provider::Primary.switch().switch(), Provider::Primary);
    }
}
