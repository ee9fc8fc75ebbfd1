#[macro_export]
macro_rules! fields {
    // Helper macro for converting an identifier to a Field
    (@field $name:ident) => {
        <netpol::types::Field as ::std::str::FromStr>::from_str(stringify!($name))
            .expect("Could not parse field name")
    };

    () => { netpol::types::FieldMap::new() };

    ($($name:ident : $value:expr),+ $(,)?) => {{
        let mut map = netpol::types::FieldMap::new();
        $(
            map.insert(fields!(@field $name), netpol::types::Value::from($value));
        )+
        map
    }};
}

#[macro_export]
macro_rules! matching {
    ($($name:ident : $value:expr),* $(,)?) => {
        netpol::pred::Pred::matching($crate::fields!($($name : $value),*))
    };
}

#[macro_export]
macro_rules! modifying {
    ($($name:ident : $value:expr),* $(,)?) => {
        netpol::policy::Policy::Modify($crate::fields!($($name : $value),*))
    };
}
