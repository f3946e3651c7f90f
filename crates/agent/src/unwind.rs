use std::any::Any;

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_owned(),
            Err(_) => "non-string panic payload".to_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::panic;

    use super::panic_message;

    #[test]
    fn extracts_static_and_formatted_messages() {
        let literal = panic::catch_unwind(|| panic!("lookup table missing"))
            .expect_err("closure panics");
        let formatted = panic::catch_unwind(|| panic!("row {} missing", 7))
            .expect_err("closure panics");
        let opaque = panic::catch_unwind(|| panic::panic_any(42_u8)).expect_err("closure panics");

        assert_eq!(panic_message(literal), "lookup table missing");
        assert_eq!(panic_message(formatted), "row 7 missing");
        assert_eq!(panic_message(opaque), "non-string panic payload");
    }
}
