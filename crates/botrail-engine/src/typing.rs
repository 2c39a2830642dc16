//! Edge-level type compatibility.

use botrail_core::TypeTag;

/// Whether `producer`'s output may flow along an edge into `consumer`'s input.
///
/// A fold step's output is carried as a list of that type. An edge leaving a
/// map fan-out compares the element type of the carried container instead.
pub fn compatible(
    producer: &TypeTag,
    consumer: &TypeTag,
    through_map_fan_out: bool,
    through_fold: bool,
) -> bool {
    let carried = if through_fold {
        TypeTag::list(producer.clone())
    } else {
        producer.clone()
    };

    if through_map_fan_out {
        return match carried.element_type() {
            Some(element) => element.is_subtype_of(consumer),
            None => false,
        };
    }
    carried.is_subtype_of(consumer)
}

/// Edges closing a map region deliver one element output at a time, so the
/// fold may declare either the single item or the collected list as input.
pub fn compatible_into_fold(producer: &TypeTag, fold_input: &TypeTag) -> bool {
    producer.is_subtype_of(fold_input) || TypeTag::list(producer.clone()).is_subtype_of(fold_input)
}
