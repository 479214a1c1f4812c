//! Plist helpers shared by the service clients

/// Renders a plist value as indented text for logs
pub fn pretty_print_plist(p: &plist::Value) -> String {
    print_plist(p, 0)
}

/// Renders a plist dictionary as indented text for logs
pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    print_dict(dict, 0)
}

fn print_dict(dict: &plist::Dictionary, indentation: usize) -> String {
    let indent = "  ".repeat(indentation);
    let items: Vec<String> = dict
        .iter()
        .map(|(k, v)| format!("{indent}  {k}: {}", print_plist(v, indentation + 1)))
        .collect();
    format!("{{\n{}\n{indent}}}", items.join(",\n"))
}

fn print_plist(p: &plist::Value, indentation: usize) -> String {
    let indent = "  ".repeat(indentation);
    match p {
        plist::Value::Array(array) => {
            let items: Vec<String> = array
                .iter()
                .map(|v| format!("{indent}  {}", print_plist(v, indentation + 1)))
                .collect();
            format!("[\n{}\n{indent}]", items.join(",\n"))
        }
        plist::Value::Dictionary(dict) => print_dict(dict, indentation),
        plist::Value::Boolean(b) => b.to_string(),
        plist::Value::Data(vec) => {
            // large blobs only clutter the log
            if vec.len() > 32 {
                format!("Data({} bytes)", vec.len())
            } else {
                format!("Data({vec:?})")
            }
        }
        plist::Value::Date(date) => format!("Date({})", date.to_xml_format()),
        plist::Value::Real(f) => f.to_string(),
        plist::Value::Integer(i) => i.to_string(),
        plist::Value::String(s) => format!("\"{s}\""),
        plist::Value::Uid(uid) => format!("Uid({})", uid.get()),
        _ => "Unknown".to_string(),
    }
}

/// Builds a request dictionary with the given `Request` name and client label
pub(crate) fn request(name: &str, label: &str) -> plist::Dictionary {
    let mut req = plist::Dictionary::new();
    req.insert("Label".into(), label.into());
    req.insert("Request".into(), name.into());
    req
}

/// Reads an integer field that devices send either signed or unsigned
pub(crate) fn dict_u64(dict: &plist::Dictionary, key: &str) -> Option<u64> {
    dict.get(key).and_then(|v| v.as_unsigned_integer())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_data_is_summarized() {
        let v = plist::Value::Data(vec![0; 100]);
        assert_eq!(pretty_print_plist(&v), "Data(100 bytes)");
    }

    #[test]
    fn request_carries_label() {
        let r = request("QueryType", "demo");
        assert_eq!(r.get("Label").and_then(|v| v.as_string()), Some("demo"));
        assert_eq!(r.get("Request").and_then(|v| v.as_string()), Some("QueryType"));
    }
}
