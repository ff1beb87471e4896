/// One mail transaction: sender, recipients and body accumulated across
/// MAIL, RCPT and DATA. Owned exclusively by the session that builds it.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: String,
    /// Recipients in submission order. Duplicates are kept.
    pub recipients: Vec<String>,
    /// Message body with CRLF line endings, set once when DATA completes.
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(sender: String) -> Self {
        Self {
            sender,
            recipients: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn add_recipient(&mut self, recipient: String) {
        self.recipients.push(recipient);
    }
}
