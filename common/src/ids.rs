/// First 8 characters of an id, for compact rendering in chat headers.
/// Ids shorter than 8 characters are returned unchanged.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn shortens_uuids() {
        assert_eq!(
            short_id("5973b6c0-94b8-487b-a530-2aeb6098ae0e"),
            "5973b6c0"
        );
    }

    #[test]
    fn leaves_short_ids_alone() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id(""), "");
    }
}
