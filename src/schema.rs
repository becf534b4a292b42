// Kept in sync by hand with `store::SCHEMA_SQL`.

diesel::table! {
    ai_models (id) {
        id -> Integer,
        model_id -> Text,
        display_name -> Text,
        description -> Nullable<Text>,
        is_free -> Bool,
        price_per_m_token -> Double,
        max_context_length -> Integer,
        can_recognize_images -> Bool,
    }
}

diesel::table! {
    chats (id) {
        id -> Integer,
        user_id -> Integer,
        title -> Text,
        is_archived -> Bool,
        parent_chat_id -> Nullable<Integer>,
        branched_after_message_id -> Nullable<Integer>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    messages (id) {
        id -> Integer,
        chat_id -> Integer,
        role -> Text,
        content -> Text,
        status -> Text,
        ai_model_id -> Nullable<Integer>,
        created_at -> Timestamp,
    }
}

diesel::joinable!(messages -> chats (chat_id));
diesel::joinable!(messages -> ai_models (ai_model_id));

diesel::allow_tables_to_appear_in_same_query!(ai_models, chats, messages,);
