use crate::error::ConfigError;

pub(crate) fn parse_key_value(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_owned(), value.trim().to_owned()))
        }
        Some(_) | None => Err(ConfigError::MalformedLine { line: s.to_owned() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_split_on_the_first_equals() -> Result<(), ConfigError> {
        let (key, value) = parse_key_value("peak=memory=5")?;
        if key != "peak" || value != "memory=5" {
            return Err(ConfigError::from(format!("Unexpected split: {key}={value}")));
        }
        Ok(())
    }

    #[test]
    fn values_may_be_empty_but_keys_may_not() -> Result<(), ConfigError> {
        let (key, value) = parse_key_value("flag=")?;
        if key != "flag" || !value.is_empty() {
            return Err(ConfigError::from(format!("Unexpected split: {key}={value}")));
        }
        match parse_key_value("=orphan") {
            Err(ConfigError::MalformedLine { .. }) => {}
            Err(other) => return Err(ConfigError::from(format!("Wrong error: {other}"))),
            Ok(_) => return Err(ConfigError::from("An empty key was accepted")),
        }
        match parse_key_value("no-equals") {
            Err(ConfigError::MalformedLine { .. }) => Ok(()),
            Err(other) => Err(ConfigError::from(format!("Wrong error: {other}"))),
            Ok(_) => Err(ConfigError::from("A bare word was accepted")),
        }
    }
}
