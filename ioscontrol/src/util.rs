// Human readable plist rendering for logs

use std::fmt::Write;

/// Long data blobs are cut to this many bytes in the output
const MAX_DATA_PREVIEW: usize = 32;

pub fn pretty_print_plist(p: &plist::Value) -> String {
    let mut out = String::new();
    print_value(&mut out, p, 0);
    out
}

pub fn pretty_print_dictionary(dict: &plist::Dictionary) -> String {
    let mut out = String::new();
    print_dictionary(&mut out, dict, 0);
    out
}

fn indent(out: &mut String, level: usize) {
    for _ in 0..level {
        out.push_str("  ");
    }
}

fn print_dictionary(out: &mut String, dict: &plist::Dictionary, level: usize) {
    if dict.is_empty() {
        out.push_str("{}");
        return;
    }
    out.push_str("{\n");
    for (k, v) in dict {
        indent(out, level + 1);
        let _ = write!(out, "{k}: ");
        print_value(out, v, level + 1);
        out.push('\n');
    }
    indent(out, level);
    out.push('}');
}

fn print_value(out: &mut String, p: &plist::Value, level: usize) {
    match p {
        plist::Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push_str("[\n");
            for item in items {
                indent(out, level + 1);
                print_value(out, item, level + 1);
                out.push('\n');
            }
            indent(out, level);
            out.push(']');
        }
        plist::Value::Dictionary(dict) => print_dictionary(out, dict, level),
        plist::Value::Boolean(b) => {
            let _ = write!(out, "{b}");
        }
        plist::Value::Data(d) => {
            let _ = write!(out, "<{} bytes", d.len());
            if !d.is_empty() {
                out.push(':');
                for b in d.iter().take(MAX_DATA_PREVIEW) {
                    let _ = write!(out, " {b:02x}");
                }
                if d.len() > MAX_DATA_PREVIEW {
                    out.push_str(" ...");
                }
            }
            out.push('>');
        }
        plist::Value::Date(d) => {
            let _ = write!(out, "{}", d.to_xml_format());
        }
        plist::Value::Real(r) => {
            let _ = write!(out, "{r}");
        }
        plist::Value::Integer(i) => {
            let _ = write!(out, "{i}");
        }
        plist::Value::String(s) => {
            let _ = write!(out, "\"{s}\"");
        }
        plist::Value::Uid(u) => {
            let _ = write!(out, "UID({})", u.get());
        }
        _ => out.push_str("<unknown>"),
    }
}
