use once_cell::sync::Lazy;
use regex::Regex;
use sos_protocol::{Coordinates, HelpRequest, RequestStatus};

use crate::error::{Error, Result};

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

pub const DESCRIPTION_CHARS: (usize, usize) = (10, 1000);
pub const LOCATION_TEXT_CHARS: (usize, usize) = (5, 200);
pub const VERIFICATION_CODE_CHARS: (usize, usize) = (4, 10);

/// Strip HTML tags and collapse runs of whitespace.
pub fn sanitize_text(raw: &str) -> String {
    let stripped = HTML_TAG.replace_all(raw, "");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}

fn bounded(field: &str, raw: &str, (min, max): (usize, usize)) -> Result<String> {
    let clean = sanitize_text(raw);
    let len = clean.chars().count();
    if len < min || len > max {
        return Err(Error::Validation(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(clean)
}

pub fn description(raw: &str) -> Result<String> {
    bounded("description", raw, DESCRIPTION_CHARS)
}

pub fn location_text(raw: Option<&str>) -> Result<Option<String>> {
    raw.map(|text| bounded("location_text", text, LOCATION_TEXT_CHARS))
        .transpose()
}

pub fn coordinates(coords: &Coordinates) -> Result<()> {
    if coords.is_valid() {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "coordinates out of range: ({}, {})",
            coords.lat, coords.lng
        )))
    }
}

/// Upper-cased alphanumeric code of bounded length.
pub fn verification_code(raw: &str) -> Result<String> {
    let code = raw.trim().to_uppercase();
    let (min, max) = VERIFICATION_CODE_CHARS;
    let len = code.chars().count();
    if len < min || len > max || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::Validation(format!(
            "verification code must be {min} to {max} letters or digits"
        )));
    }
    Ok(code)
}

/// Check a freshly published request and return it with its free text
/// sanitized.
pub fn new_request(mut request: HelpRequest) -> Result<HelpRequest> {
    if request.status != RequestStatus::Pending {
        return Err(Error::Validation(format!(
            "new request must be pending, got {}",
            request.status
        )));
    }
    coordinates(&request.coordinates)?;
    request.description = description(&request.description)?;
    request.location_text = location_text(request.location_text.as_deref())?;
    Ok(request)
}

#[cfg(test)]
mod tests {
    use sos_protocol::{Category, RequestSource};

    use super::*;

    #[test]
    fn test_sanitize_strips_tags_and_collapses_whitespace() {
        assert_eq!(
            sanitize_text("  <b>Need</b>   insulin\n<script>x</script>now "),
            "Need insulin xnow"
        );
    }

    #[test]
    fn test_description_bounds_apply_after_sanitizing() {
        assert!(description("<p>short</p>").is_err());
        assert_eq!(description("Need a doctor now").unwrap(), "Need a doctor now");
        assert!(description(&"a".repeat(1001)).is_err());
    }

    #[test]
    fn test_verification_code() {
        assert_eq!(verification_code(" abc123 ").unwrap(), "ABC123");
        assert!(verification_code("ab").is_err());
        assert!(verification_code("abc-123").is_err());
        assert!(verification_code("ABCDEFGHIJK").is_err());
    }

    #[test]
    fn test_new_request_rejects_bad_coordinates_and_status() {
        let ok = HelpRequest::new(
            RequestSource::DirectApp,
            Category::Shelter,
            "Family of four needs a place tonight",
            Coordinates::new(-1.29, 36.82),
        );
        assert!(new_request(ok.clone()).is_ok());

        let mut bad = ok.clone();
        bad.coordinates = Coordinates::new(120.0, 0.0);
        assert!(matches!(new_request(bad), Err(Error::Validation(_))));

        let mut assigned = ok;
        assigned.status = RequestStatus::Assigned;
        assert!(new_request(assigned).is_err());
    }
}
