//! Serialization helpers for `Duration`-valued configuration fields.
//! Accepts humantime strings (`"5m"`, `"90s"`) as well as bare
//! integer or floating point values interpreted as seconds.
//! Use via `#[serde(with = "duration_serde")]`.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// A wrapper type which implements `Serialize` and `Deserialize` for
/// `Duration` and `Option<Duration>`
#[derive(Copy, Clone, Eq, Hash, PartialEq)]
pub struct Wrap<T>(T);

pub fn serialize<T, S>(d: &T, s: S) -> Result<S::Ok, S::Error>
where
    for<'a> Wrap<&'a T>: Serialize,
    S: Serializer,
{
    Wrap(d).serialize(s)
}

pub fn deserialize<'a, T, D>(d: D) -> Result<T, D::Error>
where
    Wrap<T>: Deserialize<'a>,
    D: Deserializer<'a>,
{
    Wrap::deserialize(d).map(|w| w.0)
}

impl<'de> Deserialize<'de> for Wrap<Duration> {
    fn deserialize<D>(d: D) -> Result<Wrap<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct V;

        impl<'de2> serde::de::Visitor<'de2> for V {
            type Value = Duration;

            fn expecting(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
                fmt.write_str("a duration")
            }

            fn visit_f64<E>(self, v: f64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs_f64(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                match v.try_into() {
                    Ok(secs) => Ok(Duration::from_secs(secs)),
                    Err(err) => Err(E::custom(format!(
                        "duration must either be a string or a \
                         positive number of seconds. (error: {err:#})"
                    ))),
                }
            }

            fn visit_str<E>(self, v: &str) -> Result<Duration, E>
            where
                E: serde::de::Error,
            {
                humantime::parse_duration(v)
                    .map_err(|_| E::invalid_value(serde::de::Unexpected::Str(v), &self))
            }
        }

        d.deserialize_any(V).map(Wrap)
    }
}

impl<'de> Deserialize<'de> for Wrap<Option<Duration>> {
    fn deserialize<D>(d: D) -> Result<Wrap<Option<Duration>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Wrap<Duration>>::deserialize(d)? {
            Some(w) => Ok(Wrap(Some(w.0))),
            None => Ok(Wrap(None)),
        }
    }
}

impl Serialize for Wrap<&Duration> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        humantime::format_duration(*self.0).to_string().serialize(s)
    }
}

impl Serialize for Wrap<&Option<Duration>> {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self.0 {
            Some(d) => s.serialize_some(&Wrap(d)),
            None => s.serialize_none(),
        }
    }
}
