/// Enum over a fixed set of AMI wire tokens (field names, `Response:` values).
///
/// Wire tokens are matched case-insensitively on parse, since Asterisk
/// versions differ in capitalization (`ActionID` vs `ActionId`). `key()` gives
/// the lower-cased form that [`Packet`](crate::protocol::Packet) stores.
///
/// ```ignore
/// define_wire_enum! {
///     error_type: ParseResponseStatusError,
///     pub enum ResponseStatus {
///         Success => "Success",
///         Error => "Error",
///     }
/// }
/// ```
macro_rules! define_wire_enum {
    (
        error_type: $Err:ident,
        $(#[$enum_meta:meta])*
        $vis:vis enum $Name:ident {
            $(
                $(#[$var_meta:meta])*
                $variant:ident => $wire:literal
            ),+ $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        #[allow(missing_docs)]
        $vis enum $Name {
            $(
                $(#[$var_meta])*
                $variant,
            )+
        }

        impl $Name {
            /// Wire-format name string.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $Name::$variant => $wire, )+
                }
            }

            /// Lower-cased name, as stored in parsed packets.
            pub fn key(&self) -> String {
                self.as_str()
                    .to_ascii_lowercase()
            }
        }

        impl std::fmt::Display for $Name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl AsRef<str> for $Name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl std::str::FromStr for $Name {
            type Err = $Err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.eq_ignore_ascii_case($wire) {
                        return Ok($Name::$variant);
                    }
                )+
                Err($Err(s.to_string()))
            }
        }
    };
}
