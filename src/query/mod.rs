pub mod composed;
pub mod tree;

pub use composed::{
    ComposedQuery, CoreQuery, FacetRequest, Match, MissingValue, RelationalFilter, SortField,
    SortOrder, Unite, ValueType,
};
pub use tree::{BoolQuery, Query};
