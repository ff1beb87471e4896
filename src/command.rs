use crate::error::SmtpError;

/// One parsed command line.
///
/// Parsing never fails: unknown verbs and missing parameters are session
/// concerns. `params` is the second field split on `:`, which carries the
/// `FROM:<addr>` / `TO:<addr>` forms of MAIL and RCPT.
#[derive(Debug, Clone)]
pub struct Command {
    pub verb: String,
    pub fields: Vec<String>,
    pub params: Vec<String>,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let fields: Vec<String> = line.split_whitespace().map(str::to_owned).collect();
        let verb = fields
            .first()
            .map(|f| f.to_ascii_uppercase())
            .unwrap_or_default();
        let params = fields
            .get(1)
            .map(|f| f.split(':').map(str::to_owned).collect())
            .unwrap_or_default();
        Command { verb, fields, params }
    }
}

/// Validate an address-route argument and strip its angle brackets.
///
/// Only the transport-level shape is checked: the token must be enclosed in
/// `<` and `>` and contain at most one `@`. `<>` is the null reverse-path
/// and is accepted.
pub fn parse_address(src: &str) -> Result<String, SmtpError> {
    if src.len() < 2 || !src.starts_with('<') || !src.ends_with('>') {
        return Err(SmtpError::AddressSyntax(src.to_owned()));
    }
    if src.matches('@').count() > 1 {
        return Err(SmtpError::AddressSyntax(src.to_owned()));
    }
    Ok(src[1..src.len() - 1].to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uppercases_verb() {
        let cmd = Command::parse("helo client.local");
        assert_eq!(cmd.verb, "HELO");
        assert_eq!(cmd.fields, vec!["helo", "client.local"]);
    }

    #[test]
    fn parse_splits_params_on_colon() {
        let cmd = Command::parse("MAIL FROM:<user@example.com>");
        assert_eq!(cmd.verb, "MAIL");
        assert_eq!(cmd.params, vec!["FROM", "<user@example.com>"]);
    }

    #[test]
    fn parse_empty_line_has_no_fields() {
        let cmd = Command::parse("   ");
        assert!(cmd.fields.is_empty());
        assert!(cmd.verb.is_empty());
        assert!(cmd.params.is_empty());
    }

    #[test]
    fn parse_extra_fields_do_not_feed_params() {
        let cmd = Command::parse("MAIL FROM:<u@a.tld> SIZE=100");
        assert_eq!(cmd.params, vec!["FROM", "<u@a.tld>"]);
        assert_eq!(cmd.fields.len(), 3);
    }

    #[test]
    fn address_brackets_are_stripped() {
        assert_eq!(parse_address("<user@example.com>").unwrap(), "user@example.com");
    }

    #[test]
    fn null_reverse_path_is_accepted() {
        assert_eq!(parse_address("<>").unwrap(), "");
    }

    #[test]
    fn address_without_brackets_is_rejected() {
        assert!(matches!(
            parse_address("user@example.com"),
            Err(SmtpError::AddressSyntax(_))
        ));
        assert!(matches!(parse_address("<user@example.com"), Err(_)));
        assert!(matches!(parse_address("user@example.com>"), Err(_)));
        assert!(matches!(parse_address("<"), Err(_)));
    }

    #[test]
    fn address_with_two_at_signs_is_rejected() {
        assert!(matches!(
            parse_address("<user@host@other>"),
            Err(SmtpError::AddressSyntax(_))
        ));
    }
}
