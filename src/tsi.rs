//! Transport session identification.

/// Globally-unique source identifier, 48 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gsi(pub [u8; 6]);

impl Gsi {
    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Draw a random identifier; hosts without a stable identity source use
    /// this at socket creation.
    pub fn random(rng: &mut dyn rand::RngCore) -> Gsi {
        let mut bytes = [0u8; 6];
        rng.fill_bytes(&mut bytes);
        Gsi(bytes)
    }
}

impl From<[u8; 6]> for Gsi {
    fn from(bytes: [u8; 6]) -> Self {
        Gsi(bytes)
    }
}

impl std::fmt::Display for Gsi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Transport session identifier: GSI plus source port. Uniquely names a
/// sender; equality and hash are byte-wise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Tsi {
    pub gsi: Gsi,
    pub sport: u16,
}

impl Tsi {
    pub fn new(gsi: Gsi, sport: u16) -> Self {
        Self { gsi, sport }
    }
}

impl std::fmt::Display for Tsi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.gsi, self.sport)
    }
}
