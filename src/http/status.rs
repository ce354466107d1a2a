//! Status-code classification shared by inbound and outbound HTTP.

/// Recognised status codes from 100 to 511. Codes outside this set are
/// logged and never tagged on `*.status` metrics.
pub const KNOWN_STATUS_CODES: &[u16] = &[
    100, 101, 102, //
    200, 201, 202, 203, 204, 205, 206, 207, 208, 226, //
    300, 301, 302, 303, 304, 305, 307, 308, //
    400, 401, 402, 403, 404, 405, 406, 407, 408, 409, 410, 411, 412, 413, 414, 415, 416, 417,
    418, 422, 423, 424, 426, 428, 429, 431, 451, //
    500, 501, 502, 503, 504, 505, 506, 507, 508, 510, 511,
];

/// Statuses whose responses carry no body.
pub const NO_CONTENT_STATUS_CODES: &[u16] = &[204, 304];

pub fn is_known_status(code: u16) -> bool {
    KNOWN_STATUS_CODES.binary_search(&code).is_ok()
}

pub fn is_no_content_status(code: u16) -> bool {
    NO_CONTENT_STATUS_CODES.contains(&code)
}

/// Unknown codes and anything in [400, 600) count as errors.
pub fn is_error_status(code: u16) -> bool {
    !is_known_status(code) || (400..600).contains(&code)
}
