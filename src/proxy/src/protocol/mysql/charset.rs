use std::collections::HashMap;

pub const UTF8_GENERAL_CI: u16 = 33;
pub const UTF8_MB4_GENERAL_CI: u16 = 45;
pub const UTF8_MB4_0900_AI_CI: u16 = 255;
pub const BINARY_COLLATION: u16 = 63;

pub const DEFAULT_COLLATION_ID: u8 = UTF8_GENERAL_CI as u8;

pub fn collation_names() -> &'static HashMap<&'static str, u16> {
    static COLLATION_NAMES: std::sync::OnceLock<HashMap<&'static str, u16>> =
        std::sync::OnceLock::new();
    COLLATION_NAMES.get_or_init(|| {
        HashMap::from([
            ("utf8_general_ci", UTF8_GENERAL_CI),
            ("utf8mb4_general_ci", UTF8_MB4_GENERAL_CI),
            ("utf8mb4_0900_ai_ci", UTF8_MB4_0900_AI_CI),
            ("binary", BINARY_COLLATION),
        ])
    })
}
