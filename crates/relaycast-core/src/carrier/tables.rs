//! Prefix tables
//!
//! Each table is an ordered list of `(prefixes, result)` pairs matched
//! against the 10-digit national number. The first matching entry wins.
//! Entries overlap in places (several carriers share an area code); the
//! order decides.

/// Carrier by number prefix
pub(super) const CARRIER_PREFIXES: &[(&[&str], &str)] = &[
    (
        &[
            "201", "202", "203", "212", "215", "301", "302", "347", "410", "516", "551", "609",
            "610", "617", "631", "646", "703", "718", "732", "845", "908", "914", "917",
        ],
        "verizon",
    ),
    (
        &[
            "205", "212", "214", "225", "251", "256", "281", "334", "404", "415", "469", "470",
            "504", "512", "601", "615", "678", "713", "770", "832", "901", "972",
        ],
        "at&t",
    ),
    (
        &[
            "206", "253", "305", "360", "425", "503", "509", "541", "702", "786", "954", "971",
        ],
        "t-mobile",
    ),
    (&["316", "620", "785", "816", "913"], "sprint"),
    (&["217", "309", "319", "414", "563", "608"], "us cellular"),
];

/// Timezone by area code
pub(super) const TIMEZONE_PREFIXES: &[(&[&str], &str)] = &[
    (&["808"], "hawaii"),
    (&["907"], "alaska"),
    (
        &[
            "206", "209", "213", "253", "310", "323", "360", "408", "415", "425", "503", "509",
            "510", "541", "559", "619", "626", "650", "702", "707", "714", "818", "858", "916",
            "949", "971",
        ],
        "pacific",
    ),
    (
        &[
            "303", "307", "385", "406", "435", "480", "505", "520", "602", "623", "719", "720",
            "801", "928", "970",
        ],
        "mountain",
    ),
    (
        &[
            "205", "214", "217", "225", "251", "256", "281", "309", "312", "316", "319", "334",
            "405", "414", "469", "504", "512", "563", "601", "608", "612", "615", "620", "713",
            "773", "785", "816", "832", "901", "913", "918", "972",
        ],
        "central",
    ),
    (
        &[
            "201", "202", "203", "212", "215", "301", "302", "305", "347", "404", "410", "470",
            "516", "551", "609", "610", "617", "631", "646", "678", "703", "718", "732", "770",
            "786", "845", "908", "914", "917", "954",
        ],
        "eastern",
    ),
];

/// US state by area code
pub(super) const STATE_PREFIXES: &[(&[&str], &str)] = &[
    (
        &[
            "209", "213", "310", "323", "408", "415", "510", "559", "619", "626", "650", "707",
            "714", "818", "858", "916", "949",
        ],
        "CA",
    ),
    (
        &["212", "347", "516", "631", "646", "718", "845", "914", "917"],
        "NY",
    ),
    (
        &["214", "281", "469", "512", "713", "832", "972"],
        "TX",
    ),
    (&["305", "786", "954"], "FL"),
    (&["404", "470", "678", "770"], "GA"),
    (&["206", "253", "360", "425", "509"], "WA"),
    (&["503", "541", "971"], "OR"),
    (&["201", "551", "609", "732", "908"], "NJ"),
    (&["215", "610"], "PA"),
    (&["217", "309", "312", "773"], "IL"),
    (&["617"], "MA"),
    (&["202"], "DC"),
    (&["203"], "CT"),
    (&["301", "410"], "MD"),
    (&["302"], "DE"),
    (&["703"], "VA"),
    (&["205", "251", "256", "334"], "AL"),
    (&["225", "504"], "LA"),
    (&["601"], "MS"),
    (&["615", "901"], "TN"),
    (&["316", "620", "785", "913"], "KS"),
    (&["816"], "MO"),
    (&["319", "563"], "IA"),
    (&["414", "608"], "WI"),
    (&["612"], "MN"),
    (&["405", "918"], "OK"),
    (&["303", "719", "720", "970"], "CO"),
    (&["480", "520", "602", "623", "928"], "AZ"),
    (&["385", "435", "801"], "UT"),
    (&["505"], "NM"),
    (&["406"], "MT"),
    (&["307"], "WY"),
    (&["702"], "NV"),
    (&["907"], "AK"),
    (&["808"], "HI"),
];

/// SMTP-to-SMS gateway domain by normalized carrier
pub(super) const GATEWAY_DOMAINS: &[(&str, &str)] = &[
    ("verizon", "vtext.com"),
    ("at&t", "txt.att.net"),
    ("t-mobile", "tmomail.net"),
    ("sprint", "messaging.sprintpcs.com"),
    ("us cellular", "email.uscc.net"),
    ("cricket", "sms.cricketwireless.net"),
    ("boost", "sms.myboostmobile.com"),
    ("metropcs", "mymetropcs.com"),
    ("virgin", "vmobl.com"),
];

/// Fixed UTC offsets in hours (no daylight saving)
pub(super) const TIMEZONE_OFFSETS: &[(&str, i32)] = &[
    ("eastern", -5),
    ("central", -6),
    ("mountain", -7),
    ("pacific", -8),
    ("alaska", -9),
    ("hawaii", -10),
];
