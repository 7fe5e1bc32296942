//! Input validation for the login and registration forms.

use std::fmt;

use crate::error::Error;
use crate::session::Registration;
use crate::types::DEFAULT_REGISTRATION_ROLE;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Where to go after login when no `returnUrl` is given.
pub const DEFAULT_RETURN_URL: &str = "/home";

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FieldError {
    Required(&'static str),
    InvalidEmail,
    TooShort { field: &'static str, min: usize },
    PasswordMismatch,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required(field) => write!(f, "{field} is required"),
            Self::InvalidEmail => f.write_str("email must be a valid email address"),
            Self::TooShort { field, min } => {
                write!(f, "{field} must be at least {min} characters")
            }
            Self::PasswordMismatch => f.write_str("passwords must match"),
        }
    }
}

#[derive(Clone, Default)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

impl LoginForm {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] listing every invalid field.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        check_email(&self.email, &mut errors);
        if self.password.is_empty() {
            errors.push(FieldError::Required("password"));
        }
        finish(errors)
    }
}

#[derive(Clone)]
pub struct RegisterForm {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub role: String,
}

impl Default for RegisterForm {
    fn default() -> Self {
        Self {
            name: String::new(),
            email: String::new(),
            password: String::new(),
            confirm_password: String::new(),
            role: DEFAULT_REGISTRATION_ROLE.into(),
        }
    }
}

impl RegisterForm {
    /// # Errors
    ///
    /// Returns [`Error::Validation`] listing every invalid field.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push(FieldError::Required("name"));
        }
        check_email(&self.email, &mut errors);
        if self.password.is_empty() {
            errors.push(FieldError::Required("password"));
        } else if self.password.chars().count() < MIN_PASSWORD_LEN {
            errors.push(FieldError::TooShort {
                field: "password",
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.confirm_password.is_empty() {
            errors.push(FieldError::Required("confirm_password"));
        } else if self.confirm_password != self.password {
            errors.push(FieldError::PasswordMismatch);
        }
        if self.role.trim().is_empty() {
            errors.push(FieldError::Required("role"));
        }
        finish(errors)
    }

    /// Validate and convert into a [`Registration`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the form is invalid.
    pub fn into_registration(self) -> Result<Registration, Error> {
        self.validate()?;
        Ok(
            Registration::new(self.email.trim(), self.name.trim(), self.password)
                .with_role(self.role),
        )
    }
}

/// `returnUrl` from a query string (with or without the leading `?`).
///
/// Falls back to [`DEFAULT_RETURN_URL`]. Only same-site paths are honored.
#[must_use]
pub fn return_url(query: &str) -> String {
    url::form_urlencoded::parse(query.trim_start_matches('?').as_bytes())
        .find(|(key, _)| key == "returnUrl")
        .map(|(_, value)| value.into_owned())
        .filter(|value| is_local_path(value))
        .unwrap_or_else(|| DEFAULT_RETURN_URL.to_owned())
}

/// `/path`, but not `//host` or `/\host` (browsers read both as another origin).
fn is_local_path(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next() == Some('/') && !matches!(chars.next(), Some('/' | '\\'))
}

fn check_email(email: &str, errors: &mut Vec<FieldError>) {
    let email = email.trim();
    if email.is_empty() {
        errors.push(FieldError::Required("email"));
    } else if !looks_like_email(email) {
        errors.push(FieldError::InvalidEmail);
    }
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn finish(errors: Vec<FieldError>) -> Result<(), Error> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation(errors))
    }
}
