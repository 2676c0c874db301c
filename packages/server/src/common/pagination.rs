//! Offset-based pagination arguments for the jobs API.
//!
//! # Usage
//!
//! ```rust,ignore
//! // In a route handler
//! let args = PageArgs { limit: Some(50), offset: Some(100) };
//! let validated = args.validate()?;
//!
//! // In the store
//! let (jobs, total) = store.query(filter, &validated).await?;
//! ```

/// Upper bound on a single page; larger requests are clamped, not rejected.
pub const MAX_LIMIT: i64 = 1000;

/// Default page size when the caller does not specify one.
pub const DEFAULT_LIMIT: i64 = 50;

/// Raw pagination input as it arrives from the query string.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageArgs {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageArgs {
    /// Validate and normalise pagination arguments.
    ///
    /// A limit above [`MAX_LIMIT`] is clamped; a limit below 1 or a
    /// negative offset is rejected.
    pub fn validate(&self) -> Result<ValidatedPageArgs, &'static str> {
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit < 1 {
            return Err("limit must be at least 1");
        }
        let limit = limit.min(MAX_LIMIT);

        let offset = self.offset.unwrap_or(0);
        if offset < 0 {
            return Err("offset must not be negative");
        }

        Ok(ValidatedPageArgs { limit, offset })
    }
}

/// Validated and normalised pagination arguments.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedPageArgs {
    pub limit: i64,
    pub offset: i64,
}

impl ValidatedPageArgs {
    /// Whether more rows exist past this page.
    pub fn has_more(&self, page_len: usize, total: i64) -> bool {
        self.offset + (page_len as i64) < total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        let args = PageArgs::default().validate().unwrap();
        assert_eq!(args.limit, DEFAULT_LIMIT);
        assert_eq!(args.offset, 0);
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let args = PageArgs {
            limit: Some(5000),
            offset: None,
        };
        assert_eq!(args.validate().unwrap().limit, MAX_LIMIT);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let args = PageArgs {
            limit: Some(0),
            offset: None,
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn negative_offset_is_rejected() {
        let args = PageArgs {
            limit: None,
            offset: Some(-1),
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn has_more_accounts_for_offset() {
        let args = PageArgs {
            limit: Some(50),
            offset: Some(100),
        }
        .validate()
        .unwrap();
        // 150 total, page of 50 starting at 100: nothing past the page.
        assert!(!args.has_more(50, 150));
        assert!(args.has_more(50, 151));
    }
}
