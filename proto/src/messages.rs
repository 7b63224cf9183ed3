// Copyright 2024. The Banter Developers
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::fmt;

// ---------------------------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------------------------

/// Frame sent client → server. `id` is unique for the lifetime of a connection and sortable by
/// emission order when `seq` ties.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientMessage {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint32, tag = "2")]
    pub seq: u32,
    #[prost(oneof = "client_message::Body", tags = "3, 4, 5, 6")]
    pub body: ::core::option::Option<client_message::Body>,
}

pub mod client_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "3")]
        ConnectionInit(super::ConnectionInit),
        #[prost(message, tag = "4")]
        RpcCall(super::RpcCall),
        #[prost(message, tag = "5")]
        Ping(super::Ping),
        #[prost(message, tag = "6")]
        Ack(super::Ack),
    }
}

/// Frame sent server → client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerMessage {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(oneof = "server_message::Body", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub body: ::core::option::Option<server_message::Body>,
}

pub mod server_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "2")]
        ConnectionOpen(super::ConnectionOpen),
        #[prost(message, tag = "3")]
        RpcResult(super::RpcResult),
        #[prost(message, tag = "4")]
        RpcError(super::RpcError),
        #[prost(message, tag = "5")]
        Ack(super::Ack),
        #[prost(message, tag = "6")]
        Updates(super::UpdatesPayload),
        #[prost(message, tag = "7")]
        Pong(super::Pong),
        #[prost(message, tag = "8")]
        ConnectionError(super::ConnectionError),
    }
}

// ---------------------------------------------------------------------------------------------
// Handshake and liveness
// ---------------------------------------------------------------------------------------------

/// First client body after the socket opens. One per TCP connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionInit {
    #[prost(string, tag = "1")]
    pub token: ::prost::alloc::string::String,
    #[prost(uint32, tag = "2")]
    pub layer: u32,
    #[prost(string, optional, tag = "3")]
    pub build: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "4")]
    pub device: ::core::option::Option<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionOpen {}

/// The server has terminated the session; the client must refresh its auth snapshot and
/// reconnect.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionError {
    #[prost(enumeration = "ConnectionErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ConnectionErrorCode {
    Unspecified = 0,
    AuthFailed = 1,
    LayerOutdated = 2,
    ServerShutdown = 3,
    ProtocolViolation = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

/// Receipt for a client message, sent before the corresponding result is available.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(uint64, tag = "1")]
    pub msg_id: u64,
}

// ---------------------------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Method {
    Unspecified = 0,
    GetMe = 1,
    SendMessage = 2,
    EditMessage = 3,
    DeleteMessages = 4,
    GetChatHistory = 5,
    GetUpdatesState = 6,
    GetUpdates = 7,
    CreateChat = 8,
    MarkAsRead = 9,
    SetOnline = 10,
    SetTyping = 11,
}

impl Method {
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Method::SendMessage |
                Method::EditMessage |
                Method::DeleteMessages |
                Method::CreateChat |
                Method::MarkAsRead
        )
    }

    pub fn as_str_name(&self) -> &'static str {
        match self {
            Method::Unspecified => "Unspecified",
            Method::GetMe => "GetMe",
            Method::SendMessage => "SendMessage",
            Method::EditMessage => "EditMessage",
            Method::DeleteMessages => "DeleteMessages",
            Method::GetChatHistory => "GetChatHistory",
            Method::GetUpdatesState => "GetUpdatesState",
            Method::GetUpdates => "GetUpdates",
            Method::CreateChat => "CreateChat",
            Method::MarkAsRead => "MarkAsRead",
            Method::SetOnline => "SetOnline",
            Method::SetTyping => "SetTyping",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str_name())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcCall {
    #[prost(enumeration = "Method", tag = "1")]
    pub method: i32,
    #[prost(oneof = "rpc_call::Input", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12")]
    pub input: ::core::option::Option<rpc_call::Input>,
}

pub mod rpc_call {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Input {
        #[prost(message, tag = "2")]
        GetMe(super::GetMeInput),
        #[prost(message, tag = "3")]
        SendMessage(super::SendMessageInput),
        #[prost(message, tag = "4")]
        EditMessage(super::EditMessageInput),
        #[prost(message, tag = "5")]
        DeleteMessages(super::DeleteMessagesInput),
        #[prost(message, tag = "6")]
        GetChatHistory(super::GetChatHistoryInput),
        #[prost(message, tag = "7")]
        GetUpdatesState(super::GetUpdatesStateInput),
        #[prost(message, tag = "8")]
        GetUpdates(super::GetUpdatesInput),
        #[prost(message, tag = "9")]
        CreateChat(super::CreateChatInput),
        #[prost(message, tag = "10")]
        MarkAsRead(super::MarkAsReadInput),
        #[prost(message, tag = "11")]
        SetOnline(super::SetOnlineInput),
        #[prost(message, tag = "12")]
        SetTyping(super::SetTypingInput),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResult {
    #[prost(uint64, tag = "1")]
    pub req_msg_id: u64,
    #[prost(oneof = "rpc_result::Result", tags = "2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12")]
    pub result: ::core::option::Option<rpc_result::Result>,
}

pub mod rpc_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "2")]
        GetMe(super::GetMeOutput),
        #[prost(message, tag = "3")]
        SendMessage(super::SendMessageOutput),
        #[prost(message, tag = "4")]
        EditMessage(super::EditMessageOutput),
        #[prost(message, tag = "5")]
        DeleteMessages(super::DeleteMessagesOutput),
        #[prost(message, tag = "6")]
        GetChatHistory(super::GetChatHistoryOutput),
        #[prost(message, tag = "7")]
        GetUpdatesState(super::GetUpdatesStateOutput),
        #[prost(message, tag = "8")]
        GetUpdates(super::GetUpdatesOutput),
        #[prost(message, tag = "9")]
        CreateChat(super::CreateChatOutput),
        #[prost(message, tag = "10")]
        MarkAsRead(super::MarkAsReadOutput),
        #[prost(message, tag = "11")]
        SetOnline(super::SetOnlineOutput),
        #[prost(message, tag = "12")]
        SetTyping(super::SetTypingOutput),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(uint64, tag = "1")]
    pub req_msg_id: u64,
    #[prost(string, tag = "2")]
    pub error_code: ::prost::alloc::string::String,
    #[prost(uint32, tag = "3")]
    pub code: u32,
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
}

// ---------------------------------------------------------------------------------------------
// RPC inputs
// ---------------------------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMeInput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageInput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(string, tag = "2")]
    pub text: ::prost::alloc::string::String,
    /// Client-chosen id used to dedupe a resend of the same logical message.
    #[prost(uint64, tag = "3")]
    pub random_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EditMessageInput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, tag = "2")]
    pub message_id: i64,
    #[prost(string, tag = "3")]
    pub text: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMessagesInput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, repeated, tag = "2")]
    pub message_ids: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetChatHistoryInput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(uint32, tag = "2")]
    pub limit: u32,
    #[prost(int64, optional, tag = "3")]
    pub before_id: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdatesStateInput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdatesInput {
    #[prost(message, optional, tag = "1")]
    pub bucket: ::core::option::Option<Bucket>,
    #[prost(uint32, tag = "2")]
    pub since_seq: u32,
    #[prost(uint32, tag = "3")]
    pub limit: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateChatInput {
    #[prost(int64, tag = "1")]
    pub peer_user_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkAsReadInput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, tag = "2")]
    pub max_read_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetOnlineInput {
    #[prost(bool, tag = "1")]
    pub online: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTypingInput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(bool, tag = "2")]
    pub typing: bool,
}

// ---------------------------------------------------------------------------------------------
// RPC outputs
// ---------------------------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetMeOutput {
    #[prost(message, optional, tag = "1")]
    pub user: ::core::option::Option<User>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendMessageOutput {
    #[prost(message, optional, tag = "1")]
    pub message: ::core::option::Option<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EditMessageOutput {
    #[prost(message, optional, tag = "1")]
    pub message: ::core::option::Option<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteMessagesOutput {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, repeated, tag = "2")]
    pub message_ids: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetChatHistoryOutput {
    #[prost(message, repeated, tag = "1")]
    pub messages: ::prost::alloc::vec::Vec<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdatesStateOutput {
    #[prost(message, repeated, tag = "1")]
    pub buckets: ::prost::alloc::vec::Vec<BucketState>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetUpdatesOutput {
    #[prost(message, repeated, tag = "1")]
    pub updates: ::prost::alloc::vec::Vec<Update>,
    #[prost(enumeration = "UpdatesResultType", tag = "2")]
    pub result_type: i32,
    /// The bucket's current sequence and date on the server at response time.
    #[prost(uint32, tag = "3")]
    pub seq: u32,
    #[prost(int64, tag = "4")]
    pub date: i64,
    /// False when more updates exist beyond the returned slice.
    #[prost(bool, tag = "5")]
    pub r#final: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum UpdatesResultType {
    Empty = 0,
    Slice = 1,
    TooLong = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateChatOutput {
    #[prost(message, optional, tag = "1")]
    pub chat: ::core::option::Option<Chat>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MarkAsReadOutput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetOnlineOutput {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetTypingOutput {}

// ---------------------------------------------------------------------------------------------
// Domain records
// ---------------------------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct User {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub username: ::prost::alloc::string::String,
    #[prost(bool, tag = "3")]
    pub online: bool,
    #[prost(int64, optional, tag = "4")]
    pub last_seen: ::core::option::Option<i64>,
}

/// A private chat is keyed by its ordered user pair; a space thread carries the owning space.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Chat {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(int64, optional, tag = "2")]
    pub min_user_id: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub max_user_id: ::core::option::Option<i64>,
    #[prost(int64, optional, tag = "4")]
    pub space_id: ::core::option::Option<i64>,
    #[prost(string, optional, tag = "5")]
    pub title: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bool, tag = "6")]
    pub public: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Message {
    /// Server-global message id, unique across all chats.
    #[prost(int64, tag = "1")]
    pub global_id: i64,
    #[prost(int64, tag = "2")]
    pub chat_id: i64,
    /// Per-chat message id, dense and increasing within the chat.
    #[prost(int64, tag = "3")]
    pub message_id: i64,
    #[prost(int64, tag = "4")]
    pub from_user_id: i64,
    #[prost(string, tag = "5")]
    pub text: ::prost::alloc::string::String,
    #[prost(int64, tag = "6")]
    pub date: i64,
    #[prost(int64, optional, tag = "7")]
    pub edit_date: ::core::option::Option<i64>,
}

// ---------------------------------------------------------------------------------------------
// Buckets and updates
// ---------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum BucketKind {
    Unspecified = 0,
    Chat = 1,
    User = 2,
    Space = 3,
}

/// Identifies one ordered update stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct Bucket {
    #[prost(enumeration = "BucketKind", tag = "1")]
    pub kind: i32,
    #[prost(int64, tag = "2")]
    pub entity_id: i64,
}

impl Bucket {
    pub fn chat(chat_id: i64) -> Self {
        Self {
            kind: BucketKind::Chat as i32,
            entity_id: chat_id,
        }
    }

    pub fn user(user_id: i64) -> Self {
        Self {
            kind: BucketKind::User as i32,
            entity_id: user_id,
        }
    }

    pub fn space(space_id: i64) -> Self {
        Self {
            kind: BucketKind::Space as i32,
            entity_id: space_id,
        }
    }

    pub fn kind_str_name(kind: BucketKind) -> &'static str {
        match kind {
            BucketKind::Unspecified => "Unspecified",
            BucketKind::Chat => "Chat",
            BucketKind::User => "User",
            BucketKind::Space => "Space",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", Bucket::kind_str_name(self.kind()), self.entity_id)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BucketState {
    #[prost(message, optional, tag = "1")]
    pub bucket: ::core::option::Option<Bucket>,
    #[prost(uint32, tag = "2")]
    pub seq: u32,
    #[prost(int64, tag = "3")]
    pub date: i64,
}

/// One record appended to a bucket describing a committed mutation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Update {
    #[prost(uint32, tag = "1")]
    pub seq: u32,
    #[prost(int64, tag = "2")]
    pub date: i64,
    #[prost(oneof = "update::Body", tags = "3, 4, 5, 6, 7, 8, 9, 10")]
    pub update: ::core::option::Option<update::Body>,
}

pub mod update {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "3")]
        NewMessage(super::UpdateNewMessage),
        #[prost(message, tag = "4")]
        EditMessage(super::UpdateEditMessage),
        #[prost(message, tag = "5")]
        DeleteMessages(super::UpdateDeleteMessages),
        #[prost(message, tag = "6")]
        UserStatus(super::UpdateUserStatus),
        #[prost(message, tag = "7")]
        ChatHasNewUpdates(super::UpdateChatHasNewUpdates),
        #[prost(message, tag = "8")]
        SpaceHasNewUpdates(super::UpdateSpaceHasNewUpdates),
        #[prost(message, tag = "9")]
        UserHasNewUpdates(super::UpdateUserHasNewUpdates),
        #[prost(message, tag = "10")]
        Typing(super::UpdateTyping),
    }
}

impl Update {
    /// Tie-break id used when two updates carry the same `seq` and `date` after transport
    /// reordering. Message-bearing payloads sort by their global message id.
    pub fn payload_id(&self) -> i64 {
        match &self.update {
            Some(update::Body::NewMessage(u)) => u.message.as_ref().map(|m| m.global_id).unwrap_or(0),
            Some(update::Body::EditMessage(u)) => u.message.as_ref().map(|m| m.global_id).unwrap_or(0),
            Some(update::Body::DeleteMessages(u)) => u.message_ids.first().copied().unwrap_or(0),
            Some(update::Body::UserStatus(u)) => u.user_id,
            Some(update::Body::ChatHasNewUpdates(u)) => u.chat_id,
            Some(update::Body::SpaceHasNewUpdates(u)) => u.space_id,
            Some(update::Body::UserHasNewUpdates(u)) => u.user_id,
            Some(update::Body::Typing(u)) => u.user_id,
            None => 0,
        }
    }

    /// Full ascending sort key: seq, then date, then payload id.
    pub fn sort_key(&self) -> (u32, i64, i64) {
        (self.seq, self.date, self.payload_id())
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateNewMessage {
    #[prost(message, optional, tag = "1")]
    pub message: ::core::option::Option<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateEditMessage {
    #[prost(message, optional, tag = "1")]
    pub message: ::core::option::Option<Message>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateDeleteMessages {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, repeated, tag = "2")]
    pub message_ids: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateUserStatus {
    #[prost(int64, tag = "1")]
    pub user_id: i64,
    #[prost(bool, tag = "2")]
    pub online: bool,
    #[prost(int64, optional, tag = "3")]
    pub last_seen: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateChatHasNewUpdates {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateSpaceHasNewUpdates {
    #[prost(int64, tag = "1")]
    pub space_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateUserHasNewUpdates {
    #[prost(int64, tag = "1")]
    pub user_id: i64,
}

/// Ephemeral typing indicator. Broadcast live, never written to the update log.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateTyping {
    #[prost(int64, tag = "1")]
    pub chat_id: i64,
    #[prost(int64, tag = "2")]
    pub user_id: i64,
    #[prost(bool, tag = "3")]
    pub typing: bool,
}

/// Push body carrying freshly committed updates for one bucket.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdatesPayload {
    #[prost(message, optional, tag = "1")]
    pub bucket: ::core::option::Option<Bucket>,
    #[prost(message, repeated, tag = "2")]
    pub updates: ::prost::alloc::vec::Vec<Update>,
}
