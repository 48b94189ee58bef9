use crate::script::ExecutionContext;

pub const MAX_IDENTIFIER_LENGTH: usize = 32;

/// Source cursor primitives. The cursor is a byte position into the
/// immutable source buffer; it only moves backwards when a call reenters a
/// function body.
impl ExecutionContext<'_> {
    pub fn eof(&self) -> bool {
        self.pos >= self.source.len()
    }

    /// Byte under the cursor, or NUL at end of input (sources are NUL-free).
    pub fn peek(&self) -> u8 {
        self.source.get(self.pos).copied().unwrap_or(0)
    }

    pub fn peek_at(&self, offset: usize) -> u8 {
        self.source.get(self.pos + offset).copied().unwrap_or(0)
    }

    pub fn bump(&mut self) -> u8 {
        let current = self.peek();
        if !self.eof() {
            self.pos += 1;
        }
        current
    }

    pub fn skip_spaces(&mut self) {
        while !self.eof() && self.peek().is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    /// Scan `[A-Za-z][A-Za-z0-9]*`, capped at `MAX_IDENTIFIER_LENGTH - 1`
    /// bytes; anything longer is cut off and rescans as a new token.
    pub fn parse_identifier(&mut self) -> String {
        let mut identifier = String::new();

        while !self.eof()
            && self.peek().is_ascii_alphanumeric()
            && identifier.len() < MAX_IDENTIFIER_LENGTH - 1
        {
            identifier.push(self.bump() as char);
        }

        identifier
    }
}
