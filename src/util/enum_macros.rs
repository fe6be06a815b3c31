/// Generates a BACnet enumeration with named values plus catch-all variants for
/// vendor-defined and reserved values.
///
/// Many BACnet enumerations (abort reasons, reject reasons, error codes) reserve
/// a low range for ASHRAE and leave the rest to vendors. Peers may therefore send
/// values this crate has no name for, and those values must survive a round trip
/// through the enum unchanged.
///
/// # Arguments
///
/// * `$name:ident` - The name of the enum to be generated.
/// * `$variant:ident = $value:expr` - Named variants and their wire values. Named
///   values may sit inside the proprietary range.
/// * `$unit:ident` - The underlying integer type (`u8`, `u16`, `u32`).
/// * `$range:expr` - The proprietary range, e.g. `64..=255`. Unnamed values in this
///   range become `Custom`, unnamed values outside it become `Reserved`.
///
/// # Example
///
/// ```rust
/// use bacnet_tsm::generate_custom_enum;
///
/// generate_custom_enum! {
///     /// Reasons a peer may give for refusing a request
///     DemoReason {
///         Other = 0,
///         Busy = 1,
///         VendorTimeout = 70,
///     },
///     u8,
///     64..=255
/// }
///
/// let busy = DemoReason::from(1u8);
/// assert_eq!(busy, DemoReason::Busy);
/// assert!(busy.is_standard());
///
/// let vendor = DemoReason::from(80u8);
/// assert!(vendor.is_custom());
/// assert_eq!(u8::from(vendor), 80);
/// assert_eq!(format!("{}", vendor), "Custom(80)");
///
/// let reserved = DemoReason::from(12u8);
/// assert!(matches!(reserved, DemoReason::Reserved(_)));
///
/// assert!(!DemoReason::VendorTimeout.is_standard());
/// ```
///
/// # Generated Code Structure
///
/// * the named variants, `Custom(<Name>Value)` and `Reserved(<Name>Value)`;
/// * `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`, `Hash`;
/// * `Display` (variant name, `Custom(n)` or `Reserved(n)`);
/// * lossless `From<$name> for $unit` and `From<$unit> for $name`;
/// * `is_custom()` and `is_standard()`, the latter true for any value outside
///   the proprietary range.
#[macro_export]
macro_rules! generate_custom_enum {
    ($(#[$doc:meta])* $name:ident { $($(#[$vdoc:meta])* $variant:ident = $value:expr,)+ }, $unit:ident, $custom_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($(#[$vdoc])* $variant,)*
                /// Unnamed value inside the proprietary range
                Custom( [<$name Value>] ),
                /// Unnamed value outside the proprietary range
                Reserved( [<$name Value>] ),
            }

            #[doc = concat!("Raw wire value carried by [`", stringify!($name), "`] catch-all variants")]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                fn new(value: $unit) -> Self {
                    Self { value }
                }

                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl $name {
                /// True if the wire value lies in the proprietary range
                pub fn is_custom(&self) -> bool {
                    ($custom_range).contains(&$unit::from(*self))
                }

                /// True if the wire value lies in the range reserved for ASHRAE
                pub fn is_standard(&self) -> bool {
                    !self.is_custom()
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Custom( value ) => write!(f, "Custom({})", value.value()),
                        $name::Reserved( value ) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Custom( value ) => value.value(),
                        $name::Reserved( value ) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($custom_range).contains(&v) => {
                            $name::Custom( [<$name Value>]::new(v) )
                        }
                        v => $name::Reserved( [<$name Value>]::new(v) ),
                    }
                }
            }
        }
    };
}
