use std::fmt;
use std::str::FromStr;

use regex::Regex;
use std::sync::OnceLock;

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^SG-[0-9A-Za-z]{12}$").expect("static Serno pattern"))
}

/// A receiver serial number, e.g. `SG-0000000000AA`.
///
/// Construction always validates against the admissibility pattern; once
/// built, a `Serno` is known-good and compared byte-exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Serno(String);

#[derive(Debug, thiserror::Error)]
#[error("{0:?} does not match the Serno pattern SG-[0-9A-Za-z]{{12}}")]
pub struct InvalidSerno(pub String);

impl Serno {
    pub fn parse(s: &str) -> Result<Self, InvalidSerno> {
        if pattern().is_match(s) {
            Ok(Serno(s.to_owned()))
        } else {
            Err(InvalidSerno(s.to_owned()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Serno {
    type Err = InvalidSerno;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Serno::parse(s)
    }
}

impl fmt::Display for Serno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Serno {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
