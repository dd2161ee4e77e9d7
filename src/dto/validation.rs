//! Validation helpers for wire input.

use validator::ValidationError;

/// Validates that a mod acronym is 2 to 5 uppercase alphanumeric
/// characters, the format used by every known ruleset.
///
/// # Examples
///
/// ```ignore
/// validate_mod_acronym("HD")   // Ok
/// validate_mod_acronym("hd")   // Err - lowercase
/// validate_mod_acronym("H")    // Err - too short
/// ```
pub fn validate_mod_acronym(acronym: &str) -> Result<(), ValidationError> {
    if !(2..=5).contains(&acronym.len()) {
        let mut err = ValidationError::new("mod_acronym_length");
        err.message = Some(
            format!(
                "Mod acronym must be 2 to 5 characters (got {})",
                acronym.len()
            )
            .into(),
        );
        return Err(err);
    }

    if !acronym
        .chars()
        .all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_lowercase())
    {
        let mut err = ValidationError::new("mod_acronym_format");
        err.message =
            Some("Mod acronym must contain only uppercase alphanumeric characters".into());
        return Err(err);
    }

    Ok(())
}

/// Validates a full mod list, rejecting duplicates alongside bad acronyms.
pub fn validate_mod_acronyms(acronyms: &[String]) -> Result<(), ValidationError> {
    for (index, acronym) in acronyms.iter().enumerate() {
        validate_mod_acronym(acronym)?;
        if acronyms[..index].contains(acronym) {
            let mut err = ValidationError::new("mod_acronym_duplicate");
            err.message = Some(format!("Duplicate mod acronym `{acronym}`").into());
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_mod_acronym_valid() {
        assert!(validate_mod_acronym("HD").is_ok());
        assert!(validate_mod_acronym("DT").is_ok());
        assert!(validate_mod_acronym("CL").is_ok());
        assert!(validate_mod_acronym("9K").is_ok());
    }

    #[test]
    fn test_validate_mod_acronym_invalid_length() {
        assert!(validate_mod_acronym("H").is_err()); // too short
        assert!(validate_mod_acronym("TOOLONG").is_err()); // too long
        assert!(validate_mod_acronym("").is_err()); // empty
    }

    #[test]
    fn test_validate_mod_acronym_invalid_format() {
        assert!(validate_mod_acronym("hd").is_err()); // lowercase
        assert!(validate_mod_acronym("H D").is_err()); // space
        assert!(validate_mod_acronym("H-D").is_err()); // punctuation
    }

    #[test]
    fn test_validate_mod_acronyms_rejects_duplicates() {
        let mods = vec!["HD".to_string(), "DT".to_string(), "HD".to_string()];
        assert!(validate_mod_acronyms(&mods).is_err());

        let mods = vec!["HD".to_string(), "DT".to_string()];
        assert!(validate_mod_acronyms(&mods).is_ok());
    }
}
