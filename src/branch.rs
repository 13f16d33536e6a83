use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Branch {
    MainBranch,
    BetaBranch,
    AlternateBranch,
    AlternateBetaBranch,
}

impl Default for Branch {
    fn default() -> Self {
        Branch::MainBranch
    }
}

impl Branch {
    pub const ALL: [Branch; 4] = [
        Branch::MainBranch,
        Branch::BetaBranch,
        Branch::AlternateBranch,
        Branch::AlternateBetaBranch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Branch::MainBranch => "main-branch",
            Branch::BetaBranch => "beta-branch",
            Branch::AlternateBranch => "alternate-branch",
            Branch::AlternateBetaBranch => "alternate-beta-branch",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Branch::MainBranch => "Main",
            Branch::BetaBranch => "Beta",
            Branch::AlternateBranch => "Alternate",
            Branch::AlternateBetaBranch => "Alternate Beta",
        }
    }

    /// Folder name of this branch's snapshot under the snapshot root.
    pub fn folder_name(self) -> &'static str {
        self.as_str()
    }

    /// The BetaKey Steam writes when this branch is the live one.
    pub fn beta_key(self) -> &'static str {
        match self {
            Branch::MainBranch => "",
            Branch::BetaBranch => "beta",
            Branch::AlternateBranch => "alternate",
            Branch::AlternateBetaBranch => "alternate-beta",
        }
    }

    /// Maps a manifest BetaKey onto a branch. Unknown keys fall back to main.
    pub fn from_beta_key(raw: &str) -> Branch {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "main" | "stable" | "release" => Branch::MainBranch,
            "beta" => Branch::BetaBranch,
            "alternate" => Branch::AlternateBranch,
            "alternate-beta" | "alternatebeta" => Branch::AlternateBetaBranch,
            _ => Branch::MainBranch,
        }
    }

    /// Accepts identifiers (`beta-branch`), short names (`beta`) and display names.
    pub fn parse(value: &str) -> Option<Branch> {
        let needle = value.trim().to_ascii_lowercase();
        Branch::ALL.into_iter().find(|branch| {
            needle == branch.as_str()
                || needle == branch.display_name().to_ascii_lowercase()
                || (!branch.beta_key().is_empty() && needle == branch.beta_key())
                || (*branch == Branch::MainBranch && needle == "main")
        })
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beta_key_table() {
        let cases = [
            ("", Branch::MainBranch),
            ("beta", Branch::BetaBranch),
            ("alternate", Branch::AlternateBranch),
            ("alternate-beta", Branch::AlternateBetaBranch),
            ("ALTERNATEBETA", Branch::AlternateBetaBranch),
            ("garbage", Branch::MainBranch),
            ("  Stable ", Branch::MainBranch),
            ("release", Branch::MainBranch),
        ];
        for (key, expected) in cases {
            assert_eq!(Branch::from_beta_key(key), expected, "key {key:?}");
        }
    }

    #[test]
    fn parse_accepts_short_and_long_names() {
        assert_eq!(Branch::parse("beta-branch"), Some(Branch::BetaBranch));
        assert_eq!(Branch::parse("alternate-beta"), Some(Branch::AlternateBetaBranch));
        assert_eq!(Branch::parse("Main"), Some(Branch::MainBranch));
        assert_eq!(Branch::parse("nightly"), None);
    }

    #[test]
    fn serializes_as_kebab_identifier() {
        let raw = serde_json::to_string(&Branch::AlternateBetaBranch).unwrap();
        assert_eq!(raw, "\"alternate-beta-branch\"");
        let parsed: Branch = serde_json::from_str("\"beta-branch\"").unwrap();
        assert_eq!(parsed, Branch::BetaBranch);
    }
}
