/// Declares a closed identifier enum with a stable wire name and a display name.
///
/// Unlike open-ended identifiers, unknown wire names are rejected on deserialization
/// and by `FromStr`.
#[macro_export]
macro_rules! define_id_enum {
    (
        $(#[$enum_meta:meta])*
        $enum_name:ident {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident => $serde_name:literal : $display_name:literal
                $( | $alias:literal )*
            ),* $(,)?
        }
    ) => {
        $(#[$enum_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $enum_name {
            $(
                $(#[$variant_meta])*
                $variant,
            )*
        }

        impl serde::Serialize for $enum_name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $enum_name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(
                        $serde_name $(| $alias)* => Ok(Self::$variant),
                    )*
                    other => Err(format!(
                        "unknown {} '{}', expected one of: {}",
                        stringify!($enum_name),
                        other,
                        [$($serde_name),*].join(", ")
                    )),
                }
            }
        }

        impl $enum_name {
            /// Stable wire name, used in cache keys and serialized records
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(
                        Self::$variant => $serde_name,
                    )*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(
                        Self::$variant => $display_name,
                    )*
                }
            }

            pub fn all_variants() -> &'static [Self] {
                &[
                    $(
                        Self::$variant,
                    )*
                ]
            }
        }

        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
