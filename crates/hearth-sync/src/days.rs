use chrono::{NaiveDate, TimeZone};

use hearth_types::models::Message;

/// Messages of one calendar day in the viewer's time zone.
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    pub date: NaiveDate,
    pub messages: Vec<&'a Message>,
}

/// Split messages, already in creation order, into runs by local date.
pub fn group_by_day<'a, Tz, I>(messages: I, tz: &Tz) -> Vec<DayGroup<'a>>
where
    Tz: TimeZone,
    I: IntoIterator<Item = &'a Message>,
{
    let mut groups: Vec<DayGroup<'a>> = Vec::new();
    for message in messages {
        let date = message.created_at.with_timezone(tz).date_naive();
        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(message),
            _ => groups.push(DayGroup {
                date,
                messages: vec![message],
            }),
        }
    }
    groups
}
