mod helpers;
mod import;
mod matching;
mod nutrition;
mod recipe;
mod review;

pub(crate) use import::cmd_import;
pub(crate) use matching::cmd_match;
pub(crate) use nutrition::cmd_nutrition;
pub(crate) use recipe::{
    cmd_recipe_add_ingredient, cmd_recipe_create, cmd_recipe_import, cmd_recipe_list,
};
pub(crate) use review::{
    cmd_review_bulk, cmd_review_confirm, cmd_review_override, cmd_review_pending,
    cmd_review_reject, cmd_review_scan, cmd_review_stats,
};
