//! URL query string / `application/x-www-form-urlencoded` parser with
//! flexible collection support.

use memchr::memchr;
use std::{borrow::Cow, collections::HashMap, error, fmt};

/// URL query string parser.
///
/// Splits on `&` and `=` without allocating, then percent-decodes (and
/// turns `+` into a space, per the `application/x-www-form-urlencoded`
/// convention) each key/value independently. A segment with no `%` or `+`
/// decodes to a borrow of the original buffer; only segments that actually
/// need decoding allocate.
///
/// # Examples
/// ```rust
/// use spinnerette::query::Query;
/// use std::collections::HashMap;
///
/// // Parse into Vec (preserves order)
/// let query = b"name=john&age=25&city";
/// let vec_params: Vec<(_, _)> = Query::parse(query, 10).unwrap();
/// assert_eq!(vec_params.len(), 3);
///
/// // Parse into HashMap (deduplicates)
/// let hash_params: HashMap<_, _> = Query::parse(query, 10).unwrap();
/// assert_eq!(hash_params.len(), 3);
///
/// // Handle limits
/// let result = Query::parse::<Vec<_>>(b"a=1&b=2", 1);
/// assert!(result.is_err()); // Exceeds limit of 1 parameter
/// ```
/// All possible formats, plus percent-decoding and `+`-as-space:
/// ```rust
/// use spinnerette::query::Query;
///
/// let query = b"debug&name=&=Qwe&key=sda&&city=San+Jose&pct=50%25";
/// let vec_params: Vec<(_, _)> = Query::parse(query, 10).unwrap();
///
/// assert_eq!(vec_params.len(), 7);
/// assert_eq!(vec_params[0].0.as_ref(), b"debug");
/// assert_eq!(vec_params[5].1.as_ref(), b"San Jose");
/// assert_eq!(vec_params[6].1.as_ref(), b"50%");
/// ```
pub struct Query;

/// Percent-decodes `input` and turns `+` into a space. Borrows when neither
/// is present; allocates only when it actually has to rewrite bytes.
fn decode(input: &[u8]) -> Cow<'_, [u8]> {
    if !input.iter().any(|&b| b == b'%' || b == b'+') {
        return Cow::Borrowed(input);
    }

    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < input.len() => match (hex_digit(input[i + 1]), hex_digit(input[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(input[i]);
                    i += 1;
                }
            },
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Cow::Owned(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl Query {
    /// Parses a URL query string into a new collection.
    ///
    /// Helper method for parsing query strings into custom collections.
    /// Used internally by [Query::parse_into] for flexible parameter handling.
    ///
    /// # Type Parameters
    /// - `C`: Collection type implementing [QueryCollector]
    ///
    /// # Arguments
    /// - `query`: Raw bytes of the query string
    ///   (handles optional leading `?` automatically, so `?a=1` and `a=1` are equivalent)
    /// - `limit`: Maximum number of parameters to parse
    ///
    /// # Examples
    /// ```
    /// use spinnerette::query::Query;
    /// use std::collections::HashMap;
    ///
    /// // Parse into Vec (preserves order)
    /// let params: Vec<(_, _)> = Query::parse(b"name=john&age=25", 10).unwrap();
    /// assert_eq!(params.len(), 2);
    ///
    /// // Parse into HashMap (deduplicates keys)
    /// let params: HashMap<_, _> = Query::parse(b"key=1&key=2", 10).unwrap();
    /// assert_eq!(params.len(), 1); // only last value remains
    ///
    /// // Handle empty values and missing '='
    /// let params: Vec<(_, _)> = Query::parse(b"flag&empty=", 10).unwrap();
    /// assert_eq!(params[0].0.as_ref(), b"flag");
    /// assert_eq!(params[1].0.as_ref(), b"empty");
    /// ```
    #[inline(always)]
    pub fn parse<'a, C: QueryCollector<'a>>(query: &'a [u8], limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit);
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Parses a URL query string into an existing collection.
    ///
    /// This method allows reusing collection instances and provides more
    /// control over the parsing process.
    ///
    /// # Type Parameters
    /// - `C`: Collection type implementing [QueryCollector]
    ///
    /// # Arguments
    /// - `result`: Mutable reference to existing collection
    /// - `query`: Raw bytes of the query string
    /// - `limit`: Maximum number of parameters to parse
    ///
    /// # Examples
    /// ```
    /// use spinnerette::query::Query;
    ///
    /// // Reuse collection for multiple parses
    /// let mut collector = Vec::new();
    ///
    /// Query::parse_into(&mut collector, b"a=1&b=2", 10).unwrap();
    /// assert_eq!(collector.len(), 2);
    ///
    /// Query::parse_into(&mut collector, b"c=3&d=4", 10).unwrap();
    /// assert_eq!(collector.len(), 4); // parameters are appended
    ///
    /// // Handle limits
    /// let mut collector = Vec::new();
    /// let result = Query::parse_into(&mut collector, b"a=1&b=2&c=3", 2);
    /// assert!(result.is_err()); // limit exceeded after 2 parameters
    ///
    /// // Parse form data with percent-encoded values
    /// let mut collector = Vec::new();
    /// Query::parse_into(&mut collector, b"email=user%40example.com", 10).unwrap();
    /// assert_eq!(collector[0].1.as_ref(), b"user@example.com");
    /// ```
    #[inline]
    pub fn parse_into<'a, C: QueryCollector<'a>>(
        result: &mut C,
        query: &'a [u8],
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first().ok_or(Error::Empty)? {
            b'?' => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            // Check parameter limit
            if result.length() >= limit {
                return Err(Error::OverLimit(limit));
            }

            // Find next '&' or end of string
            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());

            // Find '=' within current parameter segment
            let index = memchr(b'=', &data[start..end]).unwrap_or(end - start);
            let split_index = start + index;

            // Extract key and value
            let key = &data[start..split_index];
            let value = match split_index < end {
                true => &data[split_index + 1..end], // Has value after '='
                false => b"",                        // No value (key only)
            };

            result.add_param(decode(key), decode(value));
            start = end + 1;
        }

        Ok(())
    }
}

/// A trait for types that can collect parsed query parameters.
///
/// This trait allows flexible storage of URL query parameters. Keys and
/// values arrive already percent-decoded, as [`Cow::Borrowed`] when decoding
/// was a no-op and [`Cow::Owned`] when it wasn't.
///
/// # Lifetime
/// - `'a`: The lifetime of the input query string bytes
///
/// # Examples
/// ```rust
/// use spinnerette::query::QueryCollector;
/// use std::borrow::Cow;
///
/// struct SimpleCollector(Vec<(String, String)>);
///
/// impl<'a> QueryCollector<'a> for SimpleCollector {
///     fn add_param(&mut self, key: Cow<'a, [u8]>, value: Cow<'a, [u8]>) {
///         self.0.push((
///             String::from_utf8_lossy(&key).to_string(),
///             String::from_utf8_lossy(&value).to_string(),
///         ));
///     }
///
///     fn length(&self) -> usize {
///         self.0.len()
///     }
///
///     fn with_capacity(capacity: usize) -> Self {
///         SimpleCollector(Vec::with_capacity(capacity))
///     }
/// }
/// ```
pub trait QueryCollector<'a>
where
    Self: Sized,
{
    /// Adds a parsed, percent-decoded parameter to the collection.
    ///
    /// # Arguments
    /// - `key`: The parameter name (empty if no value provided)
    /// - `value`: The parameter value (empty if no value provided)
    fn add_param(&mut self, key: Cow<'a, [u8]>, value: Cow<'a, [u8]>);

    /// Returns the current number of parameters in the collection.
    // For `length` instead of `len`, thanks to `clippy` for the tip
    // about adding the `is_empty` method, although it's not needed here
    fn length(&self) -> usize;

    /// Creates a new collection with the specified capacity.
    ///
    /// # Arguments
    /// - `capacity`: The initial capacity for the collection
    fn with_capacity(capacity: usize) -> Self;
}

// Implementation for Vec - preserves parameter order
impl<'a> QueryCollector<'a> for Vec<(Cow<'a, [u8]>, Cow<'a, [u8]>)> {
    #[inline(always)]
    fn add_param(&mut self, key: Cow<'a, [u8]>, value: Cow<'a, [u8]>) {
        self.push((key, value));
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

// Implementation for HashMap - deduplicates parameters (last wins)
impl<'a> QueryCollector<'a> for HashMap<Cow<'a, [u8]>, Cow<'a, [u8]>> {
    #[inline(always)]
    fn add_param(&mut self, key: Cow<'a, [u8]>, value: Cow<'a, [u8]>) {
        self.insert(key, value);
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

/// Error types that can occur during query parsing.
///
/// This enum provides detailed error information for different failure scenarios
/// when parsing URL query strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The number of parameters exceeded the specified limit.
    ///
    /// This error occurs when the query string contains more parameters
    /// than the allowed maximum specified in the `limit` argument.
    ///
    /// # Fields
    /// - `0`: The maximum allowed number of parameters
    OverLimit(usize),

    /// The query string is empty or contains only a '?' character.
    ///
    /// This error occurs when the input query string has no meaningful content
    /// to parse (empty, or just "?").
    Empty,
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OverLimit(limit) => {
                write!(f, "Query parameter limit exceeded: limit={}", limit)
            }
            Error::Empty => {
                write!(f, "Query string is empty or contains no parameters")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    fn str_pair<'a>(pair: &'a (Cow<'a, [u8]>, Cow<'a, [u8]>)) -> (&'a str, &'a str) {
        str_2((pair.0.as_ref(), pair.1.as_ref()))
    }

    #[test]
    fn basic() {
        let cases = ["a=1&b=2", "?a=1&b=2"];

        for line in cases {
            let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(line.as_bytes(), 8).unwrap();

            assert_eq!(params.len(), 2);
            assert_eq!(str_pair(&params[0]), ("a", "1"));
            assert_eq!(str_pair(&params[1]), ("b", "2"));
        }
    }

    #[test]
    fn full() {
        let line = b"flag&empty=&=val&&key=value";
        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(line, 10).unwrap();

        assert_eq!(params.len(), 5);
        assert_eq!(str_pair(&params[0]), ("flag", ""));
        assert_eq!(str_pair(&params[1]), ("empty", ""));
        assert_eq!(str_pair(&params[2]), ("", "val"));
        assert_eq!(str_pair(&params[3]), ("", ""));
        assert_eq!(str_pair(&params[4]), ("key", "value"));
    }

    #[test]
    fn not_complete() {
        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(b"flag&empty=&=val", 10).unwrap();

        assert_eq!(params.len(), 3);
        assert_eq!(str_pair(&params[0]), ("flag", ""));
        assert_eq!(str_pair(&params[1]), ("empty", ""));
        assert_eq!(str_pair(&params[2]), ("", "val"));
    }

    #[test]
    fn limit_error() {
        assert_eq!(
            Query::parse::<Vec<(Cow<[u8]>, Cow<[u8]>)>>(b"a&a", 1),
            Err(Error::OverLimit(1))
        );
    }

    #[test]
    fn empty_error() {
        assert_eq!(
            Query::parse::<Vec<(Cow<[u8]>, Cow<[u8]>)>>(b"", 10),
            Err(Error::Empty)
        );
    }

    #[test]
    fn percent_decodes_keys_and_values() {
        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> =
            Query::parse(b"email=user%40example.com&na%6De=jo%68n", 10).unwrap();

        assert_eq!(str_pair(&params[0]), ("email", "user@example.com"));
        assert_eq!(str_pair(&params[1]), ("name", "john"));
    }

    #[test]
    fn plus_decodes_to_space() {
        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(b"q=san+jose+ca", 10).unwrap();
        assert_eq!(str_pair(&params[0]), ("q", "san jose ca"));
    }

    #[test]
    fn malformed_percent_escape_is_kept_literal() {
        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(b"a=100%", 10).unwrap();
        assert_eq!(str_pair(&params[0]), ("a", "100%"));

        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(b"a=50%zz", 10).unwrap();
        assert_eq!(str_pair(&params[0]), ("a", "50%zz"));
    }

    #[test]
    fn no_decoding_needed_borrows_the_input() {
        let query = b"plain=value";
        let params: Vec<(Cow<[u8]>, Cow<[u8]>)> = Query::parse(query, 10).unwrap();
        assert!(matches!(params[0].0, Cow::Borrowed(_)));
        assert!(matches!(params[0].1, Cow::Borrowed(_)));
    }
}
