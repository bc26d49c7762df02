pub mod postgres;

use std::fmt;

/// Direction of a forwarded chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client -> Server
    Frontend,
    /// Server -> Client
    Backend,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Frontend => write!(f, "C->S"),
            Direction::Backend => write!(f, "S->C"),
        }
    }
}
