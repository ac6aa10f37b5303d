/// Fixed mapping between PostgreSQL type names and their OIDs, used by
/// RowDescription when describing result columns and by Parse when
/// translating client-supplied parameter OIDs back into names.
const TYPE_OIDS: &[(&str, i32)] = &[
    ("BOOL", 16),
    ("BYTEA", 17),
    ("CHAR", 18),
    ("INT8", 20),
    ("INT2", 21),
    ("INT4", 23),
    ("TEXT", 25),
    ("JSON", 114),
    ("XML", 142),
    ("FLOAT4", 700),
    ("FLOAT8", 701),
    ("VARCHAR", 1043),
    ("DATE", 1082),
    ("TIME", 1083),
    ("TIMESTAMP", 1114),
    ("TIMESTAMPZ", 1184),
    ("INTERVAL", 1186),
    ("NUMERIC", 1700),
    ("JSONB", 3802),
    ("ANY", 2276),
];

/// OID of the TEXT type, the fallback for unknown type names.
pub const TEXT_OID: i32 = 25;

/// Returns the OID for a type name, defaulting to TEXT when unknown.
pub fn type_oid(name: &str) -> i32 {
    let upper = name.to_ascii_uppercase();
    TYPE_OIDS
        .iter()
        .find(|(n, _)| *n == upper)
        .map(|(_, oid)| *oid)
        .unwrap_or(TEXT_OID)
}

/// Returns the canonical name for a type OID, if the OID is known.
pub fn type_name(oid: i32) -> Option<&'static str> {
    TYPE_OIDS
        .iter()
        .find(|(_, o)| *o == oid)
        .map(|(name, _)| *name)
}
