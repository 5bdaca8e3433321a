//! JSON-RPC 2.0 error codes.

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;

/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;

/// Method, tool, resource or prompt does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;

/// Internal error, including a failing provider.
pub const INTERNAL_ERROR: i64 = -32603;
