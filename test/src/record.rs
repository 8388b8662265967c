use concord_shared::{ContextValue, DiffError, DiffOutcome, UpdateVersion, ValueDiff};

/// A small diff-capable value used throughout the harness: two independent
/// properties plus the wrap-aware version the diff protocol tracks.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRecord {
    pub price: i64,
    pub quantity: i64,
    pub version: UpdateVersion,
}

const PRICE: u8 = 0;
const QUANTITY: u8 = 1;

impl TestRecord {
    pub fn new(price: i64, quantity: i64) -> Self {
        Self {
            price,
            quantity,
            version: UpdateVersion::ZERO,
        }
    }
}

fn decode(index: u8, payload: &[u8]) -> Result<i64, DiffError> {
    let bytes: [u8; 8] = payload
        .try_into()
        .map_err(|_| DiffError::MalformedProperty { index })?;
    Ok(i64::from_le_bytes(bytes))
}

impl ContextValue for TestRecord {
    fn supports_diff(&self) -> bool {
        true
    }

    fn update_version(&self) -> UpdateVersion {
        self.version
    }

    fn diff_against(&self, candidate: &Self) -> Result<Option<ValueDiff>, DiffError> {
        let mut diff = ValueDiff::new(self.version.next());
        if candidate.price != self.price {
            diff.set_property(PRICE, candidate.price.to_le_bytes().to_vec());
        }
        if candidate.quantity != self.quantity {
            diff.set_property(QUANTITY, candidate.quantity.to_le_bytes().to_vec());
        }
        if diff.is_empty() {
            return Ok(None);
        }
        Ok(Some(diff))
    }

    fn apply_diff(&mut self, diff: &ValueDiff) -> Result<DiffOutcome, DiffError> {
        let outcome = diff.classify(self.version);
        if outcome != DiffOutcome::Applied {
            return Ok(outcome);
        }
        if let Some(payload) = diff.property(PRICE) {
            self.price = decode(PRICE, payload)?;
        }
        if let Some(payload) = diff.property(QUANTITY) {
            self.quantity = decode(QUANTITY, payload)?;
        }
        self.version = diff.version();
        Ok(DiffOutcome::Applied)
    }
}

#[cfg(test)]
mod record_tests {
    use super::TestRecord;
    use concord_shared::{ContextValue, DiffOutcome, UpdateVersion};

    #[test]
    fn diff_carries_only_changed_properties() {
        let base = TestRecord::new(100, 5);
        let mut next = base.clone();
        next.price = 110;
        let diff = base.diff_against(&next).unwrap().unwrap();
        assert!(diff.property(0).is_some());
        assert!(diff.property(1).is_none());
        assert_eq!(diff.version(), base.version.next());
    }

    #[test]
    fn unchanged_value_diffs_to_none() {
        let base = TestRecord::new(100, 5);
        assert_eq!(base.diff_against(&base.clone()).unwrap(), None);
    }

    #[test]
    fn apply_advances_version_and_fields() {
        let base = TestRecord::new(100, 5);
        let mut next = base.clone();
        next.price = 110;
        next.quantity = 7;
        let diff = base.diff_against(&next).unwrap().unwrap();

        let mut replica = base.clone();
        assert_eq!(replica.apply_diff(&diff).unwrap(), DiffOutcome::Applied);
        assert_eq!(replica.price, 110);
        assert_eq!(replica.quantity, 7);
        assert_eq!(replica.version, base.version.next());
    }

    #[test]
    fn redelivery_is_a_noop() {
        let base = TestRecord::new(100, 5);
        let mut next = base.clone();
        next.price = 110;
        let diff = base.diff_against(&next).unwrap().unwrap();

        let mut replica = base.clone();
        replica.apply_diff(&diff).unwrap();
        let before = replica.clone();
        assert_eq!(
            replica.apply_diff(&diff).unwrap(),
            DiffOutcome::AlreadyCurrent
        );
        assert_eq!(replica, before);
    }

    #[test]
    fn skipped_diff_is_a_conflict() {
        let mut base = TestRecord::new(100, 5);
        base.version = UpdateVersion::new(3);
        let mut ahead = base.clone();
        ahead.version = UpdateVersion::new(4);
        let mut target = ahead.clone();
        target.price = 120;
        let diff = ahead.diff_against(&target).unwrap().unwrap();

        assert_eq!(base.apply_diff(&diff).unwrap(), DiffOutcome::Conflict);
        assert_eq!(base.price, 100);
    }
}
