/// Pull-style reader over a decoded `name=value&name=value` string. Each call
/// consumes what it returns; there is no way back to the start.
#[derive(Debug, Clone, Default)]
pub struct Params {
    buf: String,
    pos: usize,
}

impl Params {
    pub fn new(buf: String) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// The name runs to the first `=` or `&`. After an `=` the value runs to
    /// the next `&`; a bare name gets an empty value.
    pub fn next_parameter(&mut self) -> Option<(String, String)> {
        if self.is_exhausted() {
            return None;
        }

        let rest = &self.buf[self.pos..];
        let name_end = rest.find(|c| c == '=' || c == '&').unwrap_or(rest.len());
        let name = rest[..name_end].to_string();

        let (value, consumed) = match rest.as_bytes().get(name_end) {
            Some(b'=') => {
                let after = &rest[name_end + 1..];
                let value_end = after.find('&').unwrap_or(after.len());
                let consumed = name_end + 1 + value_end + usize::from(value_end < after.len());
                (after[..value_end].to_string(), consumed)
            }
            Some(_) => (String::new(), name_end + 1),
            None => (String::new(), name_end),
        };

        self.pos += consumed;
        Some((name, value))
    }
}

impl Iterator for Params {
    type Item = (String, String);

    fn next(&mut self) -> Option<Self::Item> {
        self.next_parameter()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pairs(input: &str) -> Vec<(String, String)> {
        Params::new(input.to_string()).collect()
    }

    fn owned(expected: &[(&str, &str)]) -> Vec<(String, String)> {
        expected
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn splits_names_values_and_bare_flags() {
        assert_eq!(
            pairs("a=1&b=hello&c"),
            owned(&[("a", "1"), ("b", "hello"), ("c", "")])
        );
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(pairs(""), owned(&[]));
    }

    #[test]
    fn empty_values_and_trailing_separator() {
        assert_eq!(pairs("ssid=&psk=x&"), owned(&[("ssid", ""), ("psk", "x")]));
    }

    #[test]
    fn value_may_contain_equals() {
        assert_eq!(pairs("expr=a=b&z=1"), owned(&[("expr", "a=b"), ("z", "1")]));
    }

    #[test]
    fn is_not_restartable() {
        let mut params = Params::new("a=1".to_string());
        assert!(params.next_parameter().is_some());
        assert!(params.next_parameter().is_none());
        assert!(params.is_exhausted());
    }
}
