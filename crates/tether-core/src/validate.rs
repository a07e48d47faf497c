//! Field validation for call arguments.
//!
//! Arguments are validated after decoding and before the handler runs. A
//! failure reaches the caller as [`ErrorCode::InvalidArgument`](crate::ErrorCode::InvalidArgument).

use core::fmt;

use bytes::Bytes;

/// A rejected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

impl std::error::Error for ValidationError {}

/// Implemented by every call argument type.
///
/// The default accepts everything; override it to check fields.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Login {
///     user: String,
///     password: String,
/// }
///
/// impl Validate for Login {
///     fn validate(&self) -> Result<(), ValidationError> {
///         if self.user.is_empty() {
///             return Err(ValidationError::new("user", "required"));
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

macro_rules! accept_all {
    ($($ty:ty),* $(,)?) => {
        $(impl Validate for $ty {})*
    };
}

accept_all!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    Bytes,
);

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> Result<(), ValidationError> {
        self.iter().try_for_each(Validate::validate)
    }
}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Some(v) => v.validate(),
            None => Ok(()),
        }
    }
}

impl<T: Validate + ?Sized> Validate for Box<T> {
    fn validate(&self) -> Result<(), ValidationError> {
        (**self).validate()
    }
}

impl<A: Validate, B: Validate> Validate for (A, B) {
    fn validate(&self) -> Result<(), ValidationError> {
        self.0.validate()?;
        self.1.validate()
    }
}

impl<A: Validate, B: Validate, C: Validate> Validate for (A, B, C) {
    fn validate(&self) -> Result<(), ValidationError> {
        self.0.validate()?;
        self.1.validate()?;
        self.2.validate()
    }
}
