use std::collections::HashMap;

/// Parses one HLS tag attribute list into a map of uppercased key to
/// unquoted value.
///
/// The input is the part after the tag colon, e.g.
/// `BANDWIDTH=128000,CODECS="avc1.4d401f,mp4a.40.2"`. A token scanner is used
/// rather than splitting on commas, since quoted values may themselves
/// contain commas. Unknown attributes are kept as-is; tokens without an `=`
/// are dropped; an empty line yields an empty map.
pub fn parse_attribute_list(line: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let bytes = line.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' && bytes[i] != b',' {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] == b',' {
            // Token without a value, skip past it.
            i += 1;
            continue;
        }
        let key = line[key_start..i].trim().to_ascii_uppercase();
        i += 1;

        let value = if i < bytes.len() && bytes[i] == b'"' {
            i += 1;
            let value_start = i;
            while i < bytes.len() && bytes[i] != b'"' {
                i += 1;
            }
            let value = line[value_start..i].to_string();
            if i < bytes.len() {
                i += 1;
            }
            // Anything between the closing quote and the next comma is junk.
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            value
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            line[value_start..i].to_string()
        };
        if i < bytes.len() {
            i += 1;
        }
        if !key.is_empty() {
            attrs.insert(key, value);
        }
    }

    attrs
}
