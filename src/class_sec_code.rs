use std::fmt;

/// Identity of a tradable instrument: exchange class code plus security code.
///
/// Used as the key of the per-instrument subscription tables.
///
/// ```
/// use quik_bridge::class_sec_code::ClassSecCode;
/// let sber = ClassSecCode::new("TQBR", "SBER");
/// assert_eq!(sber.to_string(), "TQBR:SBER");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassSecCode {
    class_code: String,
    sec_code: String,
}

impl ClassSecCode {
    /// Creates an instrument identity.
    pub fn new(class_code: impl Into<String>, sec_code: impl Into<String>) -> Self {
        Self {
            class_code: class_code.into(),
            sec_code: sec_code.into(),
        }
    }

    /// Exchange class code, e.g. `"TQBR"`.
    pub fn class_code(&self) -> &str {
        &self.class_code
    }

    /// Security code, e.g. `"SBER"`.
    pub fn sec_code(&self) -> &str {
        &self.sec_code
    }

    /// Parses the `CLASS:SEC` form produced by [`Display`](fmt::Display).
    pub fn parse(s: &str) -> Option<Self> {
        let (class_code, sec_code) = s.split_once(':')?;
        if class_code.is_empty() || sec_code.is_empty() {
            return None;
        }
        Some(Self::new(class_code, sec_code))
    }
}

impl fmt::Display for ClassSecCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class_code, self.sec_code)
    }
}
