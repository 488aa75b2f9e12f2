use photon::prelude::*;

/// Classifies trailing command-line arguments into the option list handed
/// to programs as their spawn arglist:
///
/// - `-name` is a symbol flag,
/// - `--name value` is a single-valued option,
/// - `---name a b c` consumes the rest of the line as a list option,
/// - anything else is a positional value.
pub fn parse(args: &[String]) -> Result<Value, String> {
    let mut entries = Vec::new();
    let mut index = 0;

    while index < args.len() {
        let arg = &args[index];

        if let Some(name) = arg.strip_prefix("---") {
            if name.is_empty() {
                return Err("option name missing after ---".to_string());
            }

            let rest: Vec<Value> = args[index + 1..].iter().map(|raw| classify(raw)).collect();
            entries.push(Value::pair(Value::sym(name), Value::list(rest)));
            break;
        } else if let Some(name) = arg.strip_prefix("--") {
            if name.is_empty() {
                return Err("option name missing after --".to_string());
            }

            let value = args
                .get(index + 1)
                .ok_or_else(|| format!("option --{} expects a value", name))?;
            entries.push(Value::pair(Value::sym(name), classify(value)));
            index += 2;
        } else if arg.starts_with('-') && arg.len() > 1 {
            entries.push(Value::sym(&arg[1..]));
            index += 1;
        } else {
            entries.push(classify(arg));
            index += 1;
        }
    }

    Ok(Value::list(entries))
}

/// Numbers stay numbers; everything else rides as a string.
pub fn classify(raw: &str) -> Value {
    if let Ok(value) = raw.parse::<i64>() {
        return Value::Int(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        if raw.chars().any(|chr| chr == '.' || chr == 'e' || chr == 'E') {
            return Value::Float(value);
        }
    }

    Value::str(raw)
}

/// Finds the value of a `--name`/`---name` option in a parsed option list.
pub fn lookup<'a>(options: &'a Value, name: &str) -> Option<&'a Value> {
    options.items().iter().find_map(|entry| match entry {
        Value::Pair(key, value) if key.as_symbol() == Some(name) => Some(&**value),
        _ => None,
    })
}

pub fn lookup_str(options: &Value, name: &str) -> Option<String> {
    lookup(options, name).and_then(|value| value.as_str()).map(String::from)
}

/// True when the `-name` symbol flag is present.
pub fn flag(options: &Value, name: &str) -> bool {
    options
        .items()
        .iter()
        .any(|entry| entry.as_symbol() == Some(name))
}
