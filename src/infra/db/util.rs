use crate::cache::IndexError;

pub fn map_sqlx_error(err: sqlx::Error) -> IndexError {
    match err {
        sqlx::Error::RowNotFound => IndexError::NotFound,
        sqlx::Error::Database(db) if db.message().contains("duplicate key") => {
            IndexError::Duplicate {
                constraint: db.constraint().unwrap_or("unknown").to_string(),
            }
        }
        sqlx::Error::Database(db)
            if db.message().contains("violates") || db.message().contains("value too long") =>
        {
            IndexError::invalid_input(db.message())
        }
        sqlx::Error::Database(db)
            if db
                .message()
                .contains("canceling statement due to user request") =>
        {
            IndexError::Timeout
        }
        sqlx::Error::PoolTimedOut => IndexError::Timeout,
        other => IndexError::from_persistence(other),
    }
}
