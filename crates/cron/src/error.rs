use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("empty field")]
    EmptyField,

    #[error("step given without range, expression {expression:?}")]
    StepWithoutRange { expression: String },

    #[error("failed parsing interval expression {step:?}: not an integer")]
    InvalidStep { step: String },

    #[error("step must be greater than zero: {step}")]
    NonPositiveStep { step: i64 },

    #[error("failed parsing expression {expression:?}: not an integer")]
    InvalidValue { expression: String },

    #[error("value out of range ({min} - {max}): {value}")]
    OutOfRange { min: u32, max: u32, value: String },

    #[error("got {got} want {want} expressions")]
    FieldCount { got: usize, want: usize },

    #[error("failed parsing '{field}' field {value:?}: {source}")]
    Field {
        field: &'static str,
        value: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unknown timezone: {timezone}")]
    UnknownTimezone { timezone: String },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("{message}")]
    Message { message: String },

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn context(context: impl Into<String>, source: Error) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn unknown_timezone(timezone: impl Into<String>) -> Self {
        Self::UnknownTimezone {
            timezone: timezone.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
