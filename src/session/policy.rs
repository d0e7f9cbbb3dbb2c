use std::fmt;
use std::str::FromStr;

/// When sessions are written besides the end-of-request save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionPersistPolicy {
    /// Save after each request when something changed
    Default,
    /// Save immediately on every attribute mutation made through the store
    SaveOnChange,
    /// Force a write after every request, even if nothing changed
    AlwaysSaveAfterRequest,
}

impl SessionPersistPolicy {
    pub const ALL: [SessionPersistPolicy; 3] = [
        SessionPersistPolicy::Default,
        SessionPersistPolicy::SaveOnChange,
        SessionPersistPolicy::AlwaysSaveAfterRequest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPersistPolicy::Default => "DEFAULT",
            SessionPersistPolicy::SaveOnChange => "SAVE_ON_CHANGE",
            SessionPersistPolicy::AlwaysSaveAfterRequest => "ALWAYS_SAVE_AFTER_REQUEST",
        }
    }
}

impl fmt::Display for SessionPersistPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionPersistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|p| p.as_str()).collect();
                format!(
                    "Invalid session persist policy [{}]. Must be one of [{}]",
                    s,
                    names.join(", ")
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(
            "save_on_change".parse::<SessionPersistPolicy>(),
            Ok(SessionPersistPolicy::SaveOnChange)
        );
        assert_eq!(
            "Always_Save_After_Request".parse::<SessionPersistPolicy>(),
            Ok(SessionPersistPolicy::AlwaysSaveAfterRequest)
        );
        assert_eq!(
            "DEFAULT".parse::<SessionPersistPolicy>(),
            Ok(SessionPersistPolicy::Default)
        );
    }

    #[test]
    fn test_unknown_policy_lists_choices() {
        let err = "SOMETIMES".parse::<SessionPersistPolicy>().unwrap_err();
        assert!(err.contains("SOMETIMES"));
        assert!(err.contains("SAVE_ON_CHANGE"));
    }

    #[test]
    fn test_display_matches_parse() {
        for policy in SessionPersistPolicy::ALL {
            assert_eq!(policy.to_string().parse::<SessionPersistPolicy>(), Ok(policy));
        }
    }
}
