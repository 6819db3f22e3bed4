pub type Result<T> = std::result::Result<T, crate::error::Error>;

/// Returns `InvalidArgument` from the enclosing function unless `$expr` holds.
#[macro_export]
macro_rules! verify_arg {
    ($name:expr, $expr:expr) => {{
        let result = $expr;
        $crate::result::verify_arg(result, stringify!($name), stringify!($expr))?;
    }};
}

#[inline]
pub fn verify_arg(predicate: bool, name: &str, condition: &str) -> Result<()> {
    if predicate {
        Ok(())
    } else {
        invalid_arg(name, condition)
    }
}

#[cold]
pub fn invalid_arg(name: &str, condition: &str) -> Result<()> {
    Err(crate::error::ErrorKind::InvalidArgument {
        name: name.to_string(),
        message: condition.to_string(),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use crate::verify_arg;

    fn check_rank(rank: usize, num_ranks: usize) -> crate::Result<()> {
        verify_arg!(rank, rank < num_ranks);
        Ok(())
    }

    #[test]
    fn test_verify_arg() {
        assert!(check_rank(0, 1).is_ok());
        let err = check_rank(3, 2).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument rank: rank < num_ranks");
    }
}
