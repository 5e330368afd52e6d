/// Macro to return early with a TypeError-class failure
#[macro_export]
macro_rules! type_bail {
    ($($arg:tt)*) => {
        return Err($crate::error::Error::Type(format!($($arg)*)))
    };
}
