//! Calendar and time-of-day attributes for the date and time dimensions.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};

use crate::Value;

/// Fixed-date public holidays shared by the covered markets (PL, DE, FR).
const FIXED_HOLIDAYS: &[(u32, u32, &str)] = &[
    (1, 1, "New Year's Day"),
    (1, 6, "Epiphany"),
    (5, 1, "Labour Day"),
    (5, 3, "Constitution Day"),
    (5, 8, "Victory in Europe Day"),
    (7, 14, "Bastille Day"),
    (8, 15, "Assumption Day"),
    (10, 3, "German Unity Day"),
    (11, 1, "All Saints' Day"),
    (11, 11, "Independence Day"),
    (12, 25, "Christmas Day"),
    (12, 26, "Second Day of Christmas"),
];

pub fn date_key(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d").to_string()
}

pub fn time_key(ts: NaiveDateTime) -> String {
    ts.format("%H:00").to_string()
}

pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%Y-%m-%d").ok()
}

pub fn parse_time_key(key: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(key, "%H:%M").ok()
}

pub fn season(month: u32) -> &'static str {
    match month {
        12 | 1 | 2 => "Winter",
        3..=5 => "Spring",
        6..=8 => "Summer",
        _ => "Autumn",
    }
}

pub fn day_period(hour: u32) -> &'static str {
    match hour {
        6..=11 => "Morning",
        12..=17 => "Afternoon",
        18..=21 => "Evening",
        _ => "Night",
    }
}

pub fn is_peak_hour(hour: u32) -> bool {
    (7..=9).contains(&hour) || (17..=20).contains(&hour)
}

pub fn holiday_name(date: NaiveDate) -> Option<&'static str> {
    FIXED_HOLIDAYS
        .iter()
        .find(|(month, day, _)| date.month() == *month && date.day() == *day)
        .map(|(_, _, name)| *name)
}

pub fn date_attributes(date: NaiveDate) -> Vec<(String, Value)> {
    let weekend = matches!(date.weekday(), Weekday::Sat | Weekday::Sun);
    let holiday = holiday_name(date);
    vec![
        ("full_date".into(), Value::Timestamp(date.and_time(NaiveTime::MIN))),
        ("day_of_week".into(), Value::from(date.format("%A").to_string())),
        ("day_of_month".into(), Value::Integer(date.day() as i64)),
        ("month".into(), Value::Integer(date.month() as i64)),
        ("month_name".into(), Value::from(date.format("%B").to_string())),
        ("quarter".into(), Value::Integer(((date.month() - 1) / 3 + 1) as i64)),
        ("year".into(), Value::Integer(date.year() as i64)),
        ("season".into(), Value::from(season(date.month()))),
        ("is_weekend".into(), Value::Boolean(weekend)),
        ("is_holiday".into(), Value::Boolean(holiday.is_some())),
        ("holiday_name".into(), Value::from(holiday)),
    ]
}

pub fn time_attributes(time: NaiveTime) -> Vec<(String, Value)> {
    vec![
        ("hour".into(), Value::Integer(time.hour() as i64)),
        ("minute".into(), Value::Integer(time.minute() as i64)),
        ("day_period".into(), Value::from(day_period(time.hour()))),
        ("is_peak_hour".into(), Value::Boolean(is_peak_hour(time.hour()))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr<'a>(attrs: &'a [(String, Value)], name: &str) -> &'a Value {
        &attrs.iter().find(|(k, _)| k == name).unwrap().1
    }

    #[test]
    fn seasons_follow_meteorological_quarters() {
        assert_eq!(season(12), "Winter");
        assert_eq!(season(2), "Winter");
        assert_eq!(season(3), "Spring");
        assert_eq!(season(8), "Summer");
        assert_eq!(season(11), "Autumn");
    }

    #[test]
    fn day_periods_and_peaks() {
        assert_eq!(day_period(5), "Night");
        assert_eq!(day_period(6), "Morning");
        assert_eq!(day_period(12), "Afternoon");
        assert_eq!(day_period(21), "Evening");
        assert_eq!(day_period(22), "Night");
        assert!(is_peak_hour(7));
        assert!(is_peak_hour(20));
        assert!(!is_peak_hour(12));
    }

    #[test]
    fn date_attributes_cover_calendar_flags() {
        let date = NaiveDate::from_ymd_opt(2020, 1, 5).unwrap();
        let attrs = date_attributes(date);
        assert_eq!(attr(&attrs, "day_of_week"), &Value::from("Sunday"));
        assert_eq!(attr(&attrs, "quarter"), &Value::Integer(1));
        assert_eq!(attr(&attrs, "is_weekend"), &Value::Boolean(true));
        assert_eq!(attr(&attrs, "is_holiday"), &Value::Boolean(false));

        let christmas = date_attributes(NaiveDate::from_ymd_opt(2021, 12, 25).unwrap());
        assert_eq!(attr(&christmas, "holiday_name"), &Value::from("Christmas Day"));
    }

    #[test]
    fn keys_parse_back() {
        let ts = NaiveDate::from_ymd_opt(2020, 1, 5)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        assert_eq!(date_key(ts), "2020-01-05");
        assert_eq!(time_key(ts), "14:00");
        assert_eq!(parse_time_key(&time_key(ts)).map(|t| t.hour()), Some(14));
        assert!(parse_date_key("2020-13-01").is_none());
    }
}
