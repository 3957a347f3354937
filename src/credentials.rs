use std::fmt;

/// Username/password pair for the REST endpoint or for guest logins.
///
/// Deliberately has no `Display`; `Debug` redacts the password.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `None` when no username is configured.
    pub fn from_config(username: &str, password: &str) -> Option<Self> {
        (!username.is_empty()).then(|| Self::new(username, password))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"****")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials::new("builder", "hunter2");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("builder"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn empty_username_means_no_credentials() {
        assert!(Credentials::from_config("", "secret").is_none());
        assert_eq!(
            Credentials::from_config("u", "p"),
            Some(Credentials::new("u", "p"))
        );
    }
}
