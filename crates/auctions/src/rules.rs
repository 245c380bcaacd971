use bidbus_core::{DomainError, DomainResult};

/// Model name the search catalogue refuses to list.
pub const FORBIDDEN_MODEL: &str = "Foo";

/// Search-side listing rule for a newly created auction.
pub fn ensure_listable(model: &str) -> DomainResult<()> {
    if model == FORBIDDEN_MODEL {
        return Err(DomainError::validation(format!(
            "Cannot sell cars with name {FORBIDDEN_MODEL}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_model_is_rejected_as_validation() {
        assert!(matches!(ensure_listable("Foo"), Err(DomainError::Validation(_))));
    }

    #[test]
    fn match_is_exact() {
        assert!(ensure_listable("FooBar").is_ok());
        assert!(ensure_listable("foo").is_ok());
    }
}
