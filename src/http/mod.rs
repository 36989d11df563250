//! Incremental HTTP/1.x framing.
//!
//! [`Parser`] consumes byte ranges as they arrive from a stream handle and
//! reports framing events to a [`ParserHandler`]: headers complete, body
//! spans, trailers and message complete. It does not build requests or
//! responses; that is left to the protocol layer above.

use std::fmt;

use serde::{Serialize, Serializer};

mod body;
pub mod headers;
pub mod parser;

pub use headers::Headers;
pub use parser::{
    ExecuteError, HandlerResult, HeadersInfo, MessageType, Parser, ParserHandler, ParserState,
    PauseHandle,
};

macro_rules! methods {
    ($($variant:ident => $name:literal,)+) => {
        /// A request method.
        ///
        /// The methods the parser knows by name are unit variants; any other
        /// token is kept in `Custom`.
        ///
        /// # Examples
        ///
        /// ```
        /// use uvwire::http::Method;
        ///
        /// let method: Method = "M-SEARCH".parse().unwrap();
        /// assert_eq!(method, Method::MSearch);
        /// assert_eq!(method.as_str(), "M-SEARCH");
        /// assert_eq!("BREW".parse::<Method>().unwrap(), Method::Custom("BREW".into()));
        /// ```
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum Method {
            $($variant,)+
            Custom(String),
        }

        impl Method {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)+
                    Self::Custom(s) => s.as_str(),
                }
            }
        }

        impl std::str::FromStr for Method {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(match s {
                    $($name => Self::$variant,)+
                    other => Self::Custom(other.to_owned()),
                })
            }
        }
    };
}

methods! {
    Delete => "DELETE",
    Get => "GET",
    Head => "HEAD",
    Post => "POST",
    Put => "PUT",
    Connect => "CONNECT",
    Options => "OPTIONS",
    Trace => "TRACE",
    Copy => "COPY",
    Lock => "LOCK",
    Mkcol => "MKCOL",
    Move => "MOVE",
    Propfind => "PROPFIND",
    Proppatch => "PROPPATCH",
    Search => "SEARCH",
    Unlock => "UNLOCK",
    Report => "REPORT",
    Mkactivity => "MKACTIVITY",
    Checkout => "CHECKOUT",
    Merge => "MERGE",
    MSearch => "M-SEARCH",
    Notify => "NOTIFY",
    Subscribe => "SUBSCRIBE",
    Unsubscribe => "UNSUBSCRIBE",
    Patch => "PATCH",
    Purge => "PURGE",
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Serialize for Method {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
