use crate::errors::RequestError;

use std::fmt;

/// A resident's registered identity.
///
/// A `Card` is created once, when a session registers, and is never
/// mutated afterwards. Its [`id`](Card::id) is derived from the name and
/// apartment number and is what the server sends back to confirm a
/// registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Card {
    name: String,
    apartment_no: u32,
    id: String,
}

impl Card {
    /// Validates the raw registration fields and builds a card.
    ///
    /// - `name`: surrounding whitespace is trimmed; must not end up empty.
    /// - `apartment_no`: must parse as a positive integer.
    ///
    /// # Errors
    /// Returns [`RequestError::Validation`] describing the offending field.
    ///
    /// # Example
    ///
    /// ```
    /// use resident_hub::card::Card;
    /// let card = Card::new("Ada", "101").unwrap();
    /// assert_eq!(card.id(), "Ada_101");
    /// ```
    pub fn new(name: &str, apartment_no: &str) -> Result<Self, RequestError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RequestError::Validation("name must not be empty".into()));
        }

        let apartment_no = apartment_no
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                RequestError::Validation(format!(
                    "apartment number must be a positive integer, got '{}'",
                    apartment_no
                ))
            })?;

        Ok(Self {
            id: format!("{}_{}", name, apartment_no),
            name: name.to_string(),
            apartment_no,
        })
    }

    /// Resident name as registered.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apartment number as registered.
    pub fn apartment_no(&self) -> u32 {
        self.apartment_no
    }

    /// Derived identifier, `name + "_" + apartment_no`.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.name, self.apartment_no)
    }
}
