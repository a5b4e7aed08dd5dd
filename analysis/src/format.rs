/// Format an integer with `,` between groups of three digits
pub fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3 + 1);

    if value < 0 {
        grouped.push('-');
    }

    for (index, digit) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }

    grouped
}

/// Format a float with one decimal and grouped thousands, e.g. `7,884.0`
pub fn group_thousands_f64(value: f64) -> String {
    let rendered = format!("{value:.1}");
    match rendered.split_once('.') {
        Some((whole, fraction)) => match whole.parse::<i64>() {
            Ok(whole_value) => {
                let sign = if whole_value == 0 && whole.starts_with('-') {
                    "-"
                } else {
                    ""
                };

                format!("{sign}{}.{fraction}", group_thousands(whole_value))
            }
            Err(_) => rendered,
        },
        None => rendered,
    }
}
